//! In-process thumbnail generation.

use crate::errors::{AppError, AppResult};
use crate::media_utils::is_heic;
use exif::{In, Tag};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use std::process::Command;

/// EXIF orientation (1-8) of a file, if it has one.
pub fn read_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(Tag::Orientation, In::PRIMARY)?;
    field.value.get_uint(0)
}

/// Rotates/flips a decoded raster so it displays upright.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn decode_oriented(path: &Path) -> AppResult<DynamicImage> {
    let img = image::open(path)
        .map_err(|e| AppError::Extraction(format!("failed to decode {:?}: {}", path, e)))?;
    Ok(match read_orientation(path) {
        Some(orientation) => apply_orientation(img, orientation),
        None => img,
    })
}

/// Converts a HEIC file to JPEG with vips.
fn convert_heic(source: &Path, dest: &Path) -> AppResult<()> {
    let output = Command::new("vips")
        .arg("resize")
        .arg(source)
        .arg(dest)
        .arg("1")
        .output()
        .map_err(|e| AppError::Extraction(format!("failed to run vips: {}", e)))?;
    if !output.status.success() {
        return Err(AppError::Extraction(format!(
            "vips failed on {:?}: {}",
            source,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Decodes any supported image, upright. HEIC goes through a temporary JPEG
/// whose directory is removed when this returns, on success or failure.
pub fn decode_source(path: &Path) -> AppResult<DynamicImage> {
    if !is_heic(path) {
        return decode_oriented(path);
    }
    let scratch = tempfile::Builder::new().prefix("lightbox-heic-").tempdir()?;
    let converted = scratch.path().join("converted.jpg");
    convert_heic(path, &converted)?;
    decode_oriented(&converted)
}

/// Resizes to `width`, keeping the aspect ratio.
pub fn resize_to_width(img: &DynamicImage, width: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w == 0 || w == width {
        return img.clone();
    }
    let height = ((h as f64 * width as f64 / w as f64).round() as u32).max(1);
    img.resize_exact(width, height, FilterType::Lanczos3)
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> AppResult<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)
        .map_err(|e| AppError::Generation(format!("jpeg encode failed: {}", e)))?;
    Ok(buf)
}

/// Writes through a temp file in the target directory so readers never see
/// a partial thumbnail.
pub fn write_asset(dest: &Path, bytes: &[u8]) -> AppResult<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| AppError::Generation(format!("no parent directory for {:?}", dest)))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(dest)
        .map_err(|e| AppError::Generation(format!("failed to write {:?}: {}", dest, e)))?;
    Ok(())
}

/// Resize + encode + write for one ladder size.
pub fn render(img: &DynamicImage, size: u32, quality: u8, dest: &Path) -> AppResult<()> {
    let resized = resize_to_width(img, size);
    let bytes = encode_jpeg(&resized, quality)?;
    write_asset(dest, &bytes)
}
