//! Capture-date inference: metadata fields first, file name last, then the
//! UTC offset that turns the camera's wall clock into an instant.

use super::exiftool::ToolOutput;
use crate::errors::{AppError, AppResult};
use regex::Regex;
use std::sync::OnceLock;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Metadata tags holding a capture date, most trusted first.
const DATE_FIELDS: [&str; 4] = [
    "SubSecDateTimeOriginal",
    "SubSecCreateDate",
    "DateTimeOriginal",
    "TrackCreateDate",
];

/// A parsed wall clock plus the UTC offset (minutes) written after it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub datetime: PrimitiveDateTime,
    pub offset: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    /// Capture instant in UTC.
    pub date: OffsetDateTime,
    /// Minutes east of UTC the camera clock was set to.
    pub offset: i32,
}

fn free_form_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)^
            (\d{4})[-:/.](\d{1,2})[-:/.](\d{1,2})
            (?:[\sT_]+(\d{1,2})[:.](\d{2})(?:[:.](\d{2}))?(?:[.,](\d{1,9}))?)?
            \s*(Z|[+-]\d{1,2}(?::?\d{2})?)?
            \s*$",
        )
        .expect("date pattern compiles")
    })
}

fn build(year: i32, month: u8, day: u8, hour: u8, minute: u8, second: u8, nanos: u32) -> Option<PrimitiveDateTime> {
    let month = Month::try_from(month).ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms_nano(hour, minute, second, nanos).ok()?;
    Some(PrimitiveDateTime::new(date, time))
}

/// `YYYYMMDD`, `YYYYMMDDHH`, `YYYYMMDDHHMM` or `YYYYMMDDHHMMSS`.
fn parse_compact(digits: &str) -> Option<PrimitiveDateTime> {
    if !matches!(digits.len(), 8 | 10 | 12 | 14) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |from: usize, to: usize| -> Option<u32> {
        digits.get(from..to).and_then(|s| s.parse().ok())
    };
    let year = field(0, 4)? as i32;
    let month = field(4, 6)? as u8;
    let day = field(6, 8)? as u8;
    let hour = if digits.len() >= 10 { field(8, 10)? as u8 } else { 0 };
    let minute = if digits.len() >= 12 { field(10, 12)? as u8 } else { 0 };
    let second = if digits.len() >= 14 { field(12, 14)? as u8 } else { 0 };
    build(year, month, day, hour, minute, second, 0)
}

/// Offset suffix such as `Z`, `+02:00`, `-0530` or `+2`, in minutes.
fn parse_zone_suffix(zone: &str) -> Option<i32> {
    if zone == "Z" {
        return Some(0);
    }
    let (sign, rest) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        3 | 4 => {
            let split = digits.len() - 2;
            (digits[..split].parse().ok()?, digits[split..].parse().ok()?)
        }
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 60 + minutes))
}

/// Parses the date layouts cameras, phones and exiftool produce: EXIF
/// `YYYY:MM:DD HH:MM:SS[.fff][±HH:MM]`, ISO 8601, dashed or slashed dates,
/// and compact digit runs.
pub fn parse_free_form(input: &str) -> Option<WallClock> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(datetime) = parse_compact(s) {
        return Some(WallClock {
            datetime,
            offset: None,
        });
    }

    let caps = free_form_re().captures(s)?;
    let num = |i: usize| -> Option<u32> { caps.get(i).and_then(|m| m.as_str().parse().ok()) };

    let year = num(1)? as i32;
    let month = num(2)? as u8;
    let day = num(3)? as u8;
    let hour = num(4).unwrap_or(0) as u8;
    let minute = num(5).unwrap_or(0) as u8;
    let second = num(6).unwrap_or(0) as u8;
    let nanos = match caps.get(7) {
        Some(frac) => {
            let mut padded = frac.as_str().to_string();
            while padded.len() < 9 {
                padded.push('0');
            }
            padded.parse().ok()?
        }
        None => 0,
    };
    let datetime = build(year, month, day, hour, minute, second, nanos)?;
    let offset = match caps.get(8) {
        Some(zone) => Some(parse_zone_suffix(zone.as_str())?),
        None => None,
    };
    Some(WallClock { datetime, offset })
}

/// Offset written as `H:MM` or bare minutes, as found after a `+` in a date
/// string. Hours above 23 or minutes above 59 are rejected.
pub fn parse_offset_string(value: &str) -> AppResult<i32> {
    let invalid = || AppError::Extraction(format!("invalid offset: {}", value));
    let parts: Vec<&str> = value.trim().splitn(2, ':').collect();
    let (hours, minutes) = match parts.as_slice() {
        [mins] => (0, mins.parse::<i32>().map_err(|_| invalid())?),
        [hours, mins] => (
            hours.parse::<i32>().map_err(|_| invalid())?,
            mins.parse::<i32>().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    if !(0..=59).contains(&minutes) || !(0..=23).contains(&hours) {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}

/// Date encoded in a file name such as `IMG_20230924_142148.jpg` or an epoch
/// millisecond stamp like `1404139521877.jpg`. The wall clock is taken as UTC.
pub fn date_from_filename(name: &str) -> Option<OffsetDateTime> {
    let token = name.split('.').next().unwrap_or("");
    if token.len() >= 11 {
        if let Ok(millis) = token.parse::<i64>() {
            if let Ok(ts) = OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000) {
                return Some(ts);
            }
        }
    }

    let raw_sub = if let Some(idx) = name.find("20") {
        &name[idx..]
    } else if let Some(idx) = name.find("19") {
        &name[idx..]
    } else {
        name
    };

    // Digits and separators up to the first letter; anything else is skipped.
    let mut digits = String::new();
    for c in raw_sub.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if c.is_alphabetic() {
            break;
        }
    }

    if digits.len() < 8 {
        return parse_free_form(raw_sub).map(|w| w.datetime.assume_utc());
    }

    digits.truncate(14);
    if !matches!(digits.len(), 8 | 10 | 12 | 14) {
        digits.truncate(8);
    }

    parse_compact(&digits)
        .or_else(|| parse_free_form(&digits).map(|w| w.datetime))
        .map(PrimitiveDateTime::assume_utc)
}

/// Wall clock shifted by `offset` minutes into UTC.
fn to_utc(datetime: PrimitiveDateTime, offset: i32) -> OffsetDateTime {
    datetime.assume_utc() - Duration::minutes(offset as i64)
}

/// Capture date and UTC offset for one file.
pub fn resolve(fields: &ToolOutput, file_name: &str) -> AppResult<ResolvedDate> {
    let mut wall = None;
    let mut raw = String::new();
    for key in DATE_FIELDS {
        if let Some(text) = fields.text(key) {
            match parse_free_form(&text) {
                Some(parsed) => {
                    wall = Some(parsed);
                    raw = text;
                    break;
                }
                None => log::debug!("Ignoring unparseable {} {:?} on {}", key, text, file_name),
            }
        }
    }

    let wall = match wall {
        Some(w) => w,
        None => {
            let from_name = date_from_filename(file_name).ok_or_else(|| {
                AppError::DateResolution(format!("no usable date for {}", file_name))
            })?;
            WallClock {
                datetime: PrimitiveDateTime::new(from_name.date(), from_name.time()),
                offset: None,
            }
        }
    };

    if let Some(zone) = fields.number("TimeZone") {
        let mut offset = zone as i32;
        if fields.number("DaylightSavings") == Some(1.0) {
            offset += 60;
        }
        return Ok(ResolvedDate {
            date: to_utc(wall.datetime, offset),
            offset,
        });
    }

    // East offsets are read verbatim after the `+`; `H:MM` or bare minutes.
    if let Some((_, suffix)) = raw.split_once('+') {
        let offset = parse_offset_string(suffix)?;
        return Ok(ResolvedDate {
            date: to_utc(wall.datetime, offset),
            offset,
        });
    }

    if let Some(offset) = wall.offset {
        return Ok(ResolvedDate {
            date: to_utc(wall.datetime, offset),
            offset,
        });
    }

    if let Some(gps) = fields.text("GPSDateTime").and_then(|t| parse_free_form(&t)) {
        let gps_instant = to_utc(gps.datetime, gps.offset.unwrap_or(0));
        let offset = (wall.datetime.assume_utc() - gps_instant).whole_minutes() as i32;
        return Ok(ResolvedDate {
            date: gps_instant,
            offset,
        });
    }

    Ok(ResolvedDate {
        date: wall.datetime.assume_utc(),
        offset: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::super::exiftool::FieldValue;
    use super::*;
    use time::macros::datetime;

    fn fields(pairs: &[(&str, FieldValue)]) -> ToolOutput {
        ToolOutput::from_fields(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn test_filename_dates() {
        let cases = [
            ("1404139521877", datetime!(2014-06-30 14:45:21.877 UTC)),
            ("1404139521877.jpg", datetime!(2014-06-30 14:45:21.877 UTC)),
            ("IMG_20230924_142148.jpg", datetime!(2023-09-24 14:21:48 UTC)),
            ("IMG_19990924_142148.jpg", datetime!(1999-09-24 14:21:48 UTC)),
            ("IMG_20201016_220920_128.jpg", datetime!(2020-10-16 22:09:20 UTC)),
            ("2014-06-11_14.26.04.jpg", datetime!(2014-06-11 14:26:04 UTC)),
            ("20190323-wedding-03.jpg", datetime!(2019-03-23 0:00 UTC)),
            ("20190323-wedding.jpg", datetime!(2019-03-23 0:00 UTC)),
            ("20190323-1.jpg", datetime!(2019-03-23 0:00 UTC)),
            ("20190323_wedding_03.jpg", datetime!(2019-03-23 0:00 UTC)),
            ("20190323_2.jpg", datetime!(2019-03-23 0:00 UTC)),
        ];
        for (name, expected) in cases {
            assert_eq!(date_from_filename(name), Some(expected), "{}", name);
        }
    }

    #[test]
    fn test_filename_without_date() {
        assert_eq!(date_from_filename("holiday.jpg"), None);
        assert_eq!(date_from_filename("IMG_0042.jpg"), None);
    }

    #[test]
    fn test_free_form_layouts() {
        let exif = parse_free_form("2023:09:24 14:21:48").expect("exif");
        assert_eq!(exif.datetime, datetime!(2023-09-24 14:21:48));
        assert_eq!(exif.offset, None);

        let subsec = parse_free_form("2023:09:24 14:21:48.12+02:00").expect("subsec");
        assert_eq!(subsec.datetime, datetime!(2023-09-24 14:21:48.12));
        assert_eq!(subsec.offset, Some(120));

        let iso = parse_free_form("2023-09-24T14:21:48Z").expect("iso");
        assert_eq!(iso.offset, Some(0));

        let west = parse_free_form("2023-09-24 14:21:48-0530").expect("west");
        assert_eq!(west.offset, Some(-330));

        let day = parse_free_form("2023/09/24").expect("day");
        assert_eq!(day.datetime, datetime!(2023-09-24 0:00));

        assert!(parse_free_form("0000:00:00 00:00:00").is_none());
        assert!(parse_free_form("yesterday").is_none());
    }

    #[test]
    fn test_offset_string() {
        assert_eq!(parse_offset_string("2:00").expect("2:00"), 120);
        assert_eq!(parse_offset_string("05:30").expect("05:30"), 330);
        assert_eq!(parse_offset_string("45").expect("45"), 45);
        assert!(parse_offset_string("24:00").is_err());
        assert!(parse_offset_string("2:75").is_err());
        assert!(parse_offset_string("x").is_err());
    }

    #[test]
    fn test_resolve_prefers_subsec_original() {
        let out = fields(&[
            ("SubSecDateTimeOriginal", text("2023:09:24 14:21:48.50+02:00")),
            ("DateTimeOriginal", text("2020:01:01 00:00:00")),
        ]);
        let resolved = resolve(&out, "IMG_0001.jpg").expect("resolve");
        assert_eq!(resolved.date, datetime!(2023-09-24 12:21:48.5 UTC));
        assert_eq!(resolved.offset, 120);
    }

    #[test]
    fn test_resolve_plus_suffix_offsets() {
        let out = fields(&[("DateTimeOriginal", text("2023:09:24 14:21:48+5:30"))]);
        let resolved = resolve(&out, "a.jpg").expect("resolve");
        assert_eq!(resolved.offset, 330);
        assert_eq!(resolved.date, datetime!(2023-09-24 08:51:48 UTC));

        let west = fields(&[("DateTimeOriginal", text("2023:09:24 14:21:48-05:00"))]);
        let resolved = resolve(&west, "a.jpg").expect("resolve");
        assert_eq!(resolved.offset, -300);

        let bad = fields(&[("DateTimeOriginal", text("2023:09:24 14:21:48+0200"))]);
        assert!(matches!(resolve(&bad, "a.jpg"), Err(AppError::Extraction(_))));
    }

    #[test]
    fn test_resolve_timezone_field_with_dst() {
        let out = fields(&[
            ("DateTimeOriginal", text("2023:07:01 10:00:00")),
            ("TimeZone", FieldValue::Number(60.0)),
            ("DaylightSavings", FieldValue::Number(1.0)),
        ]);
        let resolved = resolve(&out, "a.jpg").expect("resolve");
        assert_eq!(resolved.offset, 120);
        assert_eq!(resolved.date, datetime!(2023-07-01 08:00 UTC));
    }

    #[test]
    fn test_resolve_gps_delta() {
        let out = fields(&[
            ("DateTimeOriginal", text("2023:07:01 10:00:00")),
            ("GPSDateTime", text("2023:07:01 07:00:00Z")),
        ]);
        let resolved = resolve(&out, "a.jpg").expect("resolve");
        assert_eq!(resolved.offset, 180);
        assert_eq!(resolved.date, datetime!(2023-07-01 07:00 UTC));
    }

    #[test]
    fn test_resolve_video_track_date() {
        let out = fields(&[("TrackCreateDate", text("2021:02:03 04:05:06"))]);
        let resolved = resolve(&out, "clip.mov").expect("resolve");
        assert_eq!(resolved.date, datetime!(2021-02-03 04:05:06 UTC));
        assert_eq!(resolved.offset, 0);
    }

    #[test]
    fn test_resolve_falls_back_to_filename() {
        let out = fields(&[("DateTimeOriginal", text("0000:00:00 00:00:00"))]);
        let resolved = resolve(&out, "IMG_20230924_142148.jpg").expect("resolve");
        assert_eq!(resolved.date, datetime!(2023-09-24 14:21:48 UTC));
    }

    #[test]
    fn test_resolve_without_any_date() {
        let out = fields(&[]);
        assert!(matches!(
            resolve(&out, "holiday.jpg"),
            Err(AppError::DateResolution(_))
        ));
    }
}
