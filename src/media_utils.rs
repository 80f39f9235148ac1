//! Shared media utilities.
//!
//! Identity hashing, extension classification and the small path helpers used
//! by the detector, the writer and the asset pipeline.

use crate::model::MediaKind;
use std::path::Path;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "heic", "gif", "png"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov"];

/// Deterministic 32-bit identity for a relative path (or tag/folder key).
pub fn path_hash(key: &str) -> u32 {
    let digest = blake3::hash(key.as_bytes());
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Lower-case, spaces to dashes.
pub fn slugify(value: &str) -> String {
    value.to_lowercase().replace(' ', "-")
}

/// Classify by extension, case-insensitively. `None` means unsupported.
pub fn classify(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

pub fn is_heic(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("heic"))
        .unwrap_or(false)
}

/// Dot-prefixed file names are ignored by the crawl.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Path of `path` relative to `root`, with `/` separators on every platform.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Directory part of a relative key; `.` for files at the media root.
pub fn folder_key(rel: &str) -> String {
    match rel.rfind('/') {
        Some(idx) if idx > 0 => rel[..idx].to_string(),
        _ => ".".to_string(),
    }
}

/// Content type for a served asset file.
pub fn content_type(path: &Path) -> String {
    // HLS types are missing or ambiguous in the mime table.
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("m3u8") => return "application/vnd.apple.mpegurl".to_string(),
        Some("ts") => return "video/mp2t".to_string(),
        _ => {}
    }
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
