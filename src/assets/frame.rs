use crate::errors::{AppError, AppResult};
use std::path::Path;
use std::process::Command;

/// One JPEG frame from a video, read from ffmpeg's stdout. Skips the first
/// frame, which is often black.
pub fn extract_frame(ffmpeg: &Path, source: &Path) -> AppResult<Vec<u8>> {
    let output = Command::new(ffmpeg)
        .args(["-v", "error", "-i"])
        .arg(source)
        .args([
            "-vf",
            "select=gte(n\\,1)",
            "-vframes",
            "1",
            "-f",
            "image2",
            "-vcodec",
            "mjpeg",
            "pipe:",
        ])
        .output()
        .map_err(|e| AppError::Generation(format!("failed to run ffmpeg: {}", e)))?;

    if !output.status.success() || output.stdout.is_empty() {
        return Err(AppError::Generation(format!(
            "ffmpeg frame extraction failed for {:?}: {}",
            source,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}
