//! Metadata extraction: one media file in, one candidate `MediaRecord` out.

pub mod color;
pub mod dates;
pub mod exiftool;
pub mod geo;

use crate::assets::{frame, thumbnail};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::model::{MediaKind, MediaRecord, Tag};
use exiftool::{FieldValue, ToolOutput};
use futures_util::future::BoxFuture;
use geo::Geocoder;
use image::{DynamicImage, GenericImageView};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Width of the frame sampled for a video's dominant color.
const VIDEO_COLOR_SAMPLE: u32 = 400;

/// Result of extraction. Images carry their decoded raster so thumbnails can
/// be generated without decoding twice.
pub struct Extracted {
    pub record: MediaRecord,
    pub raster: Option<DynamicImage>,
}

/// Turns a file into a candidate record. Implemented by [`Extractor`]; tests
/// substitute fixed records.
pub trait MetadataSource: Send + Sync {
    fn extract<'a>(
        &'a self,
        kind: MediaKind,
        rel_path: &'a str,
        abs_path: &'a Path,
    ) -> BoxFuture<'a, AppResult<Extracted>>;
}

/// exiftool-backed extractor with optional reverse geocoding.
pub struct Extractor {
    geocoder: Geocoder,
    ffmpeg: PathBuf,
}

impl Extractor {
    pub fn new(geocoder: Geocoder, ffmpeg: PathBuf) -> Self {
        Self { geocoder, ffmpeg }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        Ok(Self::new(Geocoder::from_config(config)?, config.ffmpeg.clone()))
    }

    async fn extract_record(&self, kind: MediaKind, rel_path: &str, abs_path: &Path) -> AppResult<Extracted> {
        let rel = rel_path.to_string();
        let abs = abs_path.to_path_buf();
        let ffmpeg = self.ffmpeg.clone();

        let (mut record, raster) = tokio::task::spawn_blocking(move || read_file(&ffmpeg, kind, &rel, &abs))
            .await
            .map_err(|e| AppError::Extraction(format!("extraction of {} panicked: {}", rel_path, e)))??;

        if record.latitude != 0.0 && record.longitude != 0.0 {
            match self.geocoder.resolve(record.latitude, record.longitude).await {
                Ok(Some(place)) => record.location = geo::compose_location(&place),
                Ok(None) => {}
                Err(e) => log::warn!("Location lookup failed for {}: {}", rel_path, e),
            }
        }

        Ok(Extracted { record, raster })
    }
}

impl MetadataSource for Extractor {
    fn extract<'a>(
        &'a self,
        kind: MediaKind,
        rel_path: &'a str,
        abs_path: &'a Path,
    ) -> BoxFuture<'a, AppResult<Extracted>> {
        Box::pin(self.extract_record(kind, rel_path, abs_path))
    }
}

/// File modification time, truncated to whole seconds.
pub fn file_modified(path: &Path) -> AppResult<OffsetDateTime> {
    let modified = std::fs::metadata(path)?.modified()?;
    let modified = OffsetDateTime::from(modified);
    Ok(modified.replace_nanosecond(0).unwrap_or(modified))
}

/// The blocking half of extraction: exiftool, decode, field mapping.
fn read_file(
    ffmpeg: &Path,
    kind: MediaKind,
    rel_path: &str,
    abs_path: &Path,
) -> AppResult<(MediaRecord, Option<DynamicImage>)> {
    let fields = exiftool::run(abs_path, true, &[])?;

    let mut record = MediaRecord::new(rel_path, kind);
    record.modified = file_modified(abs_path)?;
    record.rotation = fields.number("Rotation").unwrap_or(0.0) as i32;

    let mut raster = None;
    match kind {
        MediaKind::Image => {
            let img = thumbnail::decode_source(abs_path)?;
            let (w, h) = img.dimensions();
            record.set_dimensions(w, h);
            record.color = color::dominant_color(&img);
            raster = Some(img);
        }
        MediaKind::Video => {
            let mut w = fields.number("ImageWidth").unwrap_or(0.0) as u32;
            let mut h = fields.number("ImageHeight").unwrap_or(0.0) as u32;
            if record.rotation == 90 || record.rotation == 270 {
                std::mem::swap(&mut w, &mut h);
            }
            record.set_dimensions(w, h);
            record.color = match video_color(ffmpeg, abs_path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("No frame color for {}: {}", rel_path, e);
                    String::new()
                }
            };
        }
    }

    let file_name = abs_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let resolved = dates::resolve(&fields, &file_name)?;
    record.date = resolved.date;
    record.offset = resolved.offset;

    apply_fields(&mut record, &fields)?;
    record.lens = exiftool::lens_name(abs_path)?;

    Ok((record, raster))
}

/// Maps the descriptive tags onto the record. A numeric tag holding text
/// that does not parse fails the whole extraction.
pub fn apply_fields(record: &mut MediaRecord, fields: &ToolOutput) -> AppResult<()> {
    record.rating = number_or_zero(fields, "Rating")? as i64;
    record.subject = subject_tags(fields);
    record.shutter_speed = fields
        .strict_number("ShutterSpeed")?
        .map(shutter_fraction)
        .unwrap_or_default();
    record.aperture = number_or_zero(fields, "Aperture")?;
    record.iso = iso_value(fields)?;
    record.camera = fields.text("Model").unwrap_or_default();
    record.focal_length = number_or_zero(fields, "FocalLength")?;
    record.focal_length_35 = number_or_zero(fields, "FocalLengthIn35mmFormat")?;
    record.focus_distance = number_or_zero(fields, "FocusDistance")?;
    record.altitude = number_or_zero(fields, "GPSAltitude")?;
    record.latitude = number_or_zero(fields, "GPSLatitude")?;
    record.longitude = number_or_zero(fields, "GPSLongitude")?;
    record.description = fields
        .text("Description")
        .or_else(|| fields.text("ImageDescription"))
        .unwrap_or_default();
    record.title = fields.text("Title").unwrap_or_default();
    record.software = fields.string_only("Software").unwrap_or_default();
    Ok(())
}

fn number_or_zero(fields: &ToolOutput, key: &str) -> AppResult<f64> {
    Ok(fields.strict_number(key)?.unwrap_or(0.0))
}

fn subject_tags(fields: &ToolOutput) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    if let Some(subject) = fields.get("Subject") {
        for value in subject.as_list() {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let tag = Tag::new(value);
            if !tags.iter().any(|t| t.id == tag.id) {
                tags.push(tag);
            }
        }
    }
    tags
}

/// ISO may arrive as text such as `"ISO 200"`; anything left after stripping
/// non-digits must parse.
fn iso_value(fields: &ToolOutput) -> AppResult<i64> {
    match fields.get("ISO") {
        None => Ok(0),
        Some(FieldValue::Number(n)) => Ok(*n as i64),
        Some(FieldValue::Text(s)) => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            digits
                .parse()
                .map_err(|_| AppError::Extraction(format!("error parsing ISO value: {:?}", s)))
        }
        Some(other) => Err(AppError::Extraction(format!(
            "error parsing ISO value: {:?}",
            other
        ))),
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.abs()
}

/// Exposure time as a fraction string: exact when representable at 1e-6
/// precision, otherwise the closest `i/j` with both terms at most 1000.
pub fn shutter_fraction(seconds: f64) -> String {
    const EPSILON: f64 = 1e-9;
    if !seconds.is_finite() || seconds <= 0.0 {
        return String::new();
    }

    let mut num = (seconds * 1_000_000.0) as i64;
    let mut denom = 1_000_000_i64;
    let divisor = gcd(num, denom);
    if divisor > 0 {
        num /= divisor;
        denom /= divisor;
    }
    if num > 0 && (num as f64 / denom as f64 - seconds).abs() < EPSILON {
        return format!("{}/{}", num, denom);
    }

    let (mut best_num, mut best_denom) = (1_i64, 1_i64);
    let mut best_error = (seconds - 1.0).abs();
    for i in 1..=1000_i64 {
        for j in 1..=1000_i64 {
            let error = (seconds - i as f64 / j as f64).abs();
            if error < best_error {
                best_num = i;
                best_denom = j;
                best_error = error;
            }
        }
    }
    format!("{}/{}", best_num, best_denom)
}

fn video_color(ffmpeg: &Path, path: &Path) -> AppResult<String> {
    let bytes = frame::extract_frame(ffmpeg, path)?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| AppError::Extraction(format!("frame decode failed: {}", e)))?;
    let sample = img.resize(
        VIDEO_COLOR_SAMPLE,
        u32::MAX,
        image::imageops::FilterType::Triangle,
    );
    Ok(color::dominant_color(&sample))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> ToolOutput {
        ToolOutput::from_fields(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
    }

    #[test]
    fn test_shutter_fraction() {
        assert_eq!(shutter_fraction(0.004), "1/250");
        assert_eq!(shutter_fraction(0.5), "1/2");
        assert_eq!(shutter_fraction(0.3), "3/10");
        assert_eq!(shutter_fraction(2.0), "2/1");
        assert_eq!(shutter_fraction(1.0 / 3.0), "1/3");
        assert_eq!(shutter_fraction(0.0), "");
    }

    #[test]
    fn test_iso_coercion() {
        let numeric = fields(&[("ISO", FieldValue::Number(400.0))]);
        assert_eq!(iso_value(&numeric).expect("iso"), 400);

        let text = fields(&[("ISO", FieldValue::Text("ISO 1600".into()))]);
        assert_eq!(iso_value(&text).expect("iso"), 1600);

        let junk = fields(&[("ISO", FieldValue::Text("auto".into()))]);
        assert!(matches!(iso_value(&junk), Err(AppError::Extraction(_))));

        assert_eq!(iso_value(&fields(&[])).expect("iso"), 0);
    }

    #[test]
    fn test_subject_single_and_list() {
        let single = fields(&[("Subject", FieldValue::Text("Family".into()))]);
        let tags = subject_tags(&single);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].key, "family");

        let list = fields(&[(
            "Subject",
            FieldValue::List(vec![
                FieldValue::Text("Summer Holiday".into()),
                FieldValue::Text("summer holiday".into()),
                FieldValue::Number(2023.0),
            ]),
        )]);
        let keys: Vec<String> = subject_tags(&list).into_iter().map(|t| t.key).collect();
        assert_eq!(keys, vec!["summer-holiday".to_string(), "2023".to_string()]);
    }

    #[test]
    fn test_apply_fields() {
        let out = fields(&[
            ("Model", FieldValue::Text("X100V".into())),
            ("Aperture", FieldValue::Number(2.0)),
            ("ShutterSpeed", FieldValue::Number(0.004)),
            ("FocalLengthIn35mmFormat", FieldValue::Number(35.0)),
            ("ImageDescription", FieldValue::Text("Harbour".into())),
            ("Software", FieldValue::Number(1.1)),
            ("Rating", FieldValue::Number(4.0)),
        ]);
        let mut record = MediaRecord::new("a.jpg", MediaKind::Image);
        apply_fields(&mut record, &out).expect("apply");
        assert_eq!(record.camera, "X100V");
        assert_eq!(record.shutter_speed, "1/250");
        assert_eq!(record.focal_length_35, 35.0);
        assert_eq!(record.description, "Harbour");
        assert_eq!(record.software, "");
        assert_eq!(record.rating, 4);
    }

    #[test]
    fn test_unparseable_numeric_field_fails() {
        for key in ["Aperture", "Rating", "FocalLength", "GPSLatitude", "ShutterSpeed"] {
            let out = fields(&[(key, FieldValue::Text("f/abc".into()))]);
            let mut record = MediaRecord::new("a.jpg", MediaKind::Image);
            assert!(
                matches!(apply_fields(&mut record, &out), Err(AppError::Extraction(_))),
                "{}",
                key
            );
        }

        let numeric_text = fields(&[("Aperture", FieldValue::Text(" 2.8 ".into()))]);
        let mut record = MediaRecord::new("a.jpg", MediaKind::Image);
        apply_fields(&mut record, &numeric_text).expect("apply");
        assert_eq!(record.aperture, 2.8);
    }
}
