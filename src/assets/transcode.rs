use crate::errors::{AppError, AppResult};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const INDEX_FILE: &str = "index.m3u8";

/// A playlist is usable once ffmpeg has written its end marker.
pub fn is_complete(index: &Path) -> bool {
    std::fs::read_to_string(index)
        .map(|body| body.contains("#EXT-X-ENDLIST"))
        .unwrap_or(false)
}

fn ffmpeg_args(source: &Path, index: &Path, resolution: u32) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-c:v".into(),
        "libx264".into(),
        "-crf".into(),
        "23".into(),
        "-preset".into(),
        "veryfast".into(),
        "-maxrate".into(),
        "1500k".into(),
        "-bufsize".into(),
        "3000k".into(),
        "-vf".into(),
        format!("scale=-2:{}", resolution),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "96k".into(),
        "-hls_time".into(),
        "1".into(),
        "-hls_list_size".into(),
        "0".into(),
        "-start_number".into(),
        "0".into(),
        "-f".into(),
        "hls".into(),
        index.to_string_lossy().into_owned(),
    ]
}

/// Blocking HLS transcode into `out_dir`. A failed run removes the
/// directory so the next request starts clean.
pub fn run(ffmpeg: &Path, source: &Path, out_dir: &Path, resolution: u32) -> AppResult<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let index = out_dir.join(INDEX_FILE);

    log::info!("Transcoding {:?} at {}p", source, resolution);
    let output = Command::new(ffmpeg)
        .args(ffmpeg_args(source, &index, resolution))
        .output()
        .map_err(|e| AppError::Generation(format!("failed to run ffmpeg: {}", e)));

    let failure = match output {
        Ok(out) if out.status.success() && is_complete(&index) => return Ok(index),
        Ok(out) => AppError::Generation(format!(
            "ffmpeg transcode failed for {:?}: {}",
            source,
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(e) => e,
    };

    if let Err(e) = std::fs::remove_dir_all(out_dir) {
        log::warn!("Failed to clean up {:?}: {}", out_dir, e);
    }
    Err(failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_scale_and_segments() {
        let args = ffmpeg_args(Path::new("/m/a.mov"), Path::new("/c/video/1/index.m3u8"), 720);
        let joined = args.join(" ");
        assert!(joined.contains("-vf scale=-2:720"));
        assert!(joined.contains("-hls_time 1 -hls_list_size 0 -start_number 0 -f hls"));
        assert!(joined.ends_with("/c/video/1/index.m3u8"));
    }

    #[test]
    fn test_is_complete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = dir.path().join(INDEX_FILE);
        assert!(!is_complete(&index));
        std::fs::write(&index, "#EXTM3U\n#EXTINF:1.0,\nindex0.ts\n").expect("write");
        assert!(!is_complete(&index));
        std::fs::write(&index, "#EXTM3U\n#EXTINF:1.0,\nindex0.ts\n#EXT-X-ENDLIST\n").expect("write");
        assert!(is_complete(&index));
    }
}
