use crate::errors::{AppError, AppResult};
use crate::media_utils::{path_hash, slugify};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

/// The "unknown date" value. Never persisted for a media row, and excluded
/// from every temporal query.
pub const NO_DATE: OffsetDateTime = match Date::from_calendar_date(1, Month::January, 1) {
    Ok(date) => date.midnight().assume_utc(),
    Err(_) => OffsetDateTime::UNIX_EPOCH,
};

/// Stored form of every date column: millisecond precision, always UTC.
pub const DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// `NO_DATE` in its stored form.
pub const NO_DATE_STRING: &str = "0001-01-01T00:00:00.000Z";

pub fn format_date(date: OffsetDateTime) -> String {
    date.to_offset(time::UtcOffset::UTC)
        .format(DATE_FORMAT)
        .unwrap_or_else(|_| NO_DATE_STRING.to_string())
}

pub fn parse_date(value: &str) -> AppResult<OffsetDateTime> {
    time::PrimitiveDateTime::parse(value, DATE_FORMAT)
        .map(|dt| dt.assume_utc())
        .map_err(|e| AppError::InvalidInput(format!("bad stored date {:?}: {}", value, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u32,
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(value: &str) -> Self {
        let key = slugify(value);
        Self {
            id: path_hash(&key),
            key,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: u32,
    pub key: String,
}

impl Folder {
    pub fn new(key: &str) -> Self {
        Self {
            id: path_hash(key),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanError {
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    pub error: String,
}

/// One indexed photo or video. `id` is the hash of `path`, which is relative
/// to the media root and always uses `/` separators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: u32,
    pub path: String,
    pub subject: Vec<Tag>,
    pub width: u32,
    pub height: u32,
    pub ratio: f64,
    pub padding: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    pub folder: String,
    pub rating: i64,
    pub shutter_speed: String,
    pub aperture: f64,
    pub iso: i64,
    pub lens: String,
    pub camera: String,
    pub focal_length: f64,
    pub altitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub media_type: MediaKind,
    pub focus_distance: f64,
    pub focal_length_35: f64,
    pub color: String,
    pub location: String,
    pub description: String,
    pub title: String,
    pub software: String,
    pub offset: i32,
    pub rotation: i32,
}

impl MediaRecord {
    /// An empty record for `path`, dated `NO_DATE` until extraction fills it in.
    pub fn new(path: &str, media_type: MediaKind) -> Self {
        Self {
            id: path_hash(path),
            path: path.to_string(),
            subject: Vec::new(),
            width: 0,
            height: 0,
            ratio: 0.0,
            padding: 0.0,
            date: NO_DATE,
            modified: NO_DATE,
            folder: crate::media_utils::folder_key(path),
            rating: 0,
            shutter_speed: String::new(),
            aperture: 0.0,
            iso: 0,
            lens: String::new(),
            camera: String::new(),
            focal_length: 0.0,
            altitude: 0.0,
            latitude: 0.0,
            longitude: 0.0,
            media_type,
            focus_distance: 0.0,
            focal_length_35: 0.0,
            color: String::new(),
            location: String::new(),
            description: String::new(),
            title: String::new(),
            software: String::new(),
            offset: 0,
            rotation: 0,
        }
    }

    /// Sets width/height and the derived ratio and padding.
    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        if width > 0 {
            self.ratio = height as f64 / width as f64;
            self.padding = self.ratio * 100.0;
        } else {
            self.ratio = 0.0;
            self.padding = 0.0;
        }
    }

    pub fn has_date(&self) -> bool {
        self.date != NO_DATE
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaKind::Video
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_no_date_round_trip() {
        assert_eq!(format_date(NO_DATE), NO_DATE_STRING);
        assert_eq!(parse_date(NO_DATE_STRING).expect("parse"), NO_DATE);
    }

    #[test]
    fn test_format_date_millis() {
        let date = datetime!(2014-06-30 14:45:21.877 UTC);
        assert_eq!(format_date(date), "2014-06-30T14:45:21.877Z");
    }

    #[test]
    fn test_format_date_converts_to_utc() {
        let date = datetime!(2023-09-24 14:21:48 +2);
        assert_eq!(format_date(date), "2023-09-24T12:21:48.000Z");
    }

    #[test]
    fn test_dimensions() {
        let mut record = MediaRecord::new("2023/trip/a.jpg", MediaKind::Image);
        record.set_dimensions(400, 300);
        assert_eq!(record.ratio, 0.75);
        assert_eq!(record.padding, 75.0);
        assert_eq!(record.folder, "2023/trip");
        assert!(!record.has_date());
    }

    #[test]
    fn test_tag_slug() {
        let tag = Tag::new("Summer Holiday");
        assert_eq!(tag.key, "summer-holiday");
        assert_eq!(tag.value, "Summer Holiday");
        assert_eq!(tag.id, path_hash("summer-holiday"));
    }
}
