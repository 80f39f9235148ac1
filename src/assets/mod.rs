//! Derived assets: thumbnail ladders and HLS transcodes.
//!
//! File presence under the cache root is the source of truth: a thumbnail
//! lives at `<cache>/<size>/<id>.jpg`, a transcode at
//! `<cache>/video/<id>/index.m3u8` plus its segments. Everything here can be
//! deleted and regenerated from the index.

pub mod frame;
pub mod remote;
pub mod thumbnail;
pub mod transcode;

use crate::config::Config;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::media_utils::{content_type, is_heic};
use crate::model::{MediaKind, MediaRecord};
use crate::sizes::{is_valid_size, ladder_for};
use futures_util::FutureExt;
use image::DynamicImage;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

pub fn thumbnail_path(cache_root: &Path, size: u32, id: u32) -> PathBuf {
    cache_root.join(size.to_string()).join(format!("{}.jpg", id))
}

pub fn hls_dir(cache_root: &Path, id: u32) -> PathBuf {
    cache_root.join("video").join(id.to_string())
}

pub fn hls_index_path(cache_root: &Path, id: u32) -> PathBuf {
    hls_dir(cache_root, id).join(transcode::INDEX_FILE)
}

/// A file ready to be served, with the timestamp conditional requests use.
#[derive(Debug, Clone)]
pub struct ServedAsset {
    pub path: PathBuf,
    pub modified: OffsetDateTime,
    pub content_type: String,
}

impl ServedAsset {
    async fn from_disk(path: PathBuf) -> Option<Self> {
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let modified = meta
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        Some(Self {
            content_type: content_type(&path),
            path,
            modified,
        })
    }
}

pub struct AssetPipeline {
    db: Arc<Database>,
    media_root: PathBuf,
    cache_root: PathBuf,
    quality: u8,
    transcode_resolution: u32,
    ffmpeg: PathBuf,
    resize_service: Option<String>,
    client: reqwest::Client,
    /// Held for the whole of a transcode; one ffmpeg encode at a time.
    transcode_lock: Mutex<()>,
}

impl AssetPipeline {
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        Self {
            db,
            media_root: config.media.clone(),
            cache_root: config.cache.clone(),
            quality: config.quality,
            transcode_resolution: config.transcode_resolution,
            ffmpeg: config.ffmpeg.clone(),
            resize_service: config.resize_service.clone(),
            client: reqwest::Client::new(),
            transcode_lock: Mutex::new(()),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    fn source_path(&self, record: &MediaRecord) -> PathBuf {
        self.media_root.join(&record.path)
    }

    /// Serves a thumbnail, generating it on first request.
    pub async fn thumbnail(&self, id: u32, size: u32) -> AppResult<ServedAsset> {
        let record = self
            .db
            .media_by_id(id)?
            .ok_or_else(|| AppError::NotFound(format!("media {}", id)))?;
        if !is_valid_size(size, record.width) {
            return Err(AppError::InvalidInput(format!(
                "thumb request out of band: size {} for width {}",
                size, record.width
            )));
        }

        let path = thumbnail_path(&self.cache_root, size, id);
        if let Some(existing) = ServedAsset::from_disk(path.clone()).await {
            return Ok(existing);
        }

        self.generate(&record, size, None).await?;
        Ok(ServedAsset {
            content_type: content_type(&path),
            path,
            modified: OffsetDateTime::now_utc(),
        })
    }

    /// Ladder sizes with no file on disk.
    pub fn missing_sizes(&self, record: &MediaRecord) -> Vec<u32> {
        ladder_for(record.width)
            .into_iter()
            .filter(|&size| !thumbnail_path(&self.cache_root, size, record.id).is_file())
            .collect()
    }

    /// Generates the ladder for a freshly extracted record. Existing files
    /// are kept unless `regenerate` is set. Returns how many were written.
    pub async fn pregenerate(
        &self,
        record: &MediaRecord,
        raster: Option<Arc<DynamicImage>>,
        regenerate: bool,
    ) -> AppResult<usize> {
        let sizes = if regenerate {
            ladder_for(record.width)
        } else {
            self.missing_sizes(record)
        };

        let mut written = 0;
        for size in sizes {
            self.generate(record, size, raster.clone()).await?;
            written += 1;
        }
        Ok(written)
    }

    /// One thumbnail. Panics inside generation come back as `Generation`.
    pub async fn generate(
        &self,
        record: &MediaRecord,
        size: u32,
        raster: Option<Arc<DynamicImage>>,
    ) -> AppResult<()> {
        match AssertUnwindSafe(self.generate_inner(record, size, raster))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Generation(format!(
                "thumbnail generation panicked for {} at {}",
                record.path, size
            ))),
        }
    }

    async fn generate_inner(
        &self,
        record: &MediaRecord,
        size: u32,
        raster: Option<Arc<DynamicImage>>,
    ) -> AppResult<()> {
        let source = self.source_path(record);
        let dest = thumbnail_path(&self.cache_root, size, record.id);

        if let Some(service) = &self.resize_service {
            return self.generate_remote(service, record, &source, &dest, size).await;
        }

        let kind = record.media_type;
        let quality = self.quality;
        let ffmpeg = self.ffmpeg.clone();
        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let img = match raster {
                Some(img) => img,
                None => Arc::new(load_raster(&ffmpeg, kind, &source)?),
            };
            thumbnail::render(&img, size, quality, &dest)
        })
        .await
        .map_err(|e| AppError::Generation(format!("thumbnail task failed: {}", e)))?
        .map_err(into_generation)
    }

    async fn generate_remote(
        &self,
        service: &str,
        record: &MediaRecord,
        source: &Path,
        dest: &Path,
        size: u32,
    ) -> AppResult<()> {
        let heic = is_heic(source);
        let bytes = match record.media_type {
            MediaKind::Image => tokio::fs::read(source).await?,
            MediaKind::Video => {
                let source = source.to_path_buf();
                let ffmpeg = self.ffmpeg.clone();
                tokio::task::spawn_blocking(move || frame::extract_frame(&ffmpeg, &source))
                    .await
                    .map_err(|e| AppError::Generation(format!("frame task failed: {}", e)))??
            }
        };
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let request = remote::ResizeRequest {
            size,
            quality: self.quality,
            heic: heic && record.media_type == MediaKind::Image,
        };
        let resized = remote::resize(&self.client, service, &request, file_name, bytes).await?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || thumbnail::write_asset(&dest, &resized))
            .await
            .map_err(|e| AppError::Generation(format!("write task failed: {}", e)))?
    }

    /// HLS playlist for a video, transcoding on first request. Transcodes
    /// queue behind one lock.
    pub async fn transcode(&self, id: u32) -> AppResult<PathBuf> {
        let record = self
            .db
            .media_by_id(id)?
            .ok_or_else(|| AppError::NotFound(format!("media {}", id)))?;
        self.transcode_record(&record).await
    }

    pub async fn transcode_record(&self, record: &MediaRecord) -> AppResult<PathBuf> {
        if !record.is_video() {
            return Err(AppError::InvalidInput(format!("{} is not a video", record.path)));
        }
        let index = hls_index_path(&self.cache_root, record.id);
        if transcode::is_complete(&index) {
            return Ok(index);
        }

        let _guard = self.transcode_lock.lock().await;
        // Another request may have finished it while we waited.
        if transcode::is_complete(&index) {
            return Ok(index);
        }

        let source = self.source_path(record);
        let out_dir = hls_dir(&self.cache_root, record.id);
        let resolution = self.transcode_resolution;
        let ffmpeg = self.ffmpeg.clone();
        tokio::task::spawn_blocking(move || transcode::run(&ffmpeg, &source, &out_dir, resolution))
            .await
            .map_err(|e| AppError::Generation(format!("transcode panicked: {}", e)))?
    }

    /// A playlist or segment file of a video's transcode.
    pub async fn hls_file(&self, id: u32, name: &str) -> AppResult<ServedAsset> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(AppError::InvalidInput(format!("bad segment name: {}", name)));
        }
        self.transcode(id).await?;
        let path = hls_dir(&self.cache_root, id).join(name);
        ServedAsset::from_disk(path)
            .await
            .ok_or_else(|| AppError::NotFound(format!("{} for media {}", name, id)))
    }

    /// Removes every ladder thumbnail of a record. Missing files are fine.
    pub fn remove_thumbnails(cache_root: &Path, record: &MediaRecord) {
        for size in ladder_for(record.width) {
            let path = thumbnail_path(cache_root, size, record.id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }

    /// Removes a video's HLS directory so the next transcode starts over.
    pub fn remove_transcode(cache_root: &Path, record: &MediaRecord) {
        let dir = hls_dir(cache_root, record.id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {:?}: {}", dir, e),
        }
    }
}

fn load_raster(ffmpeg: &Path, kind: MediaKind, source: &Path) -> AppResult<DynamicImage> {
    match kind {
        MediaKind::Image => thumbnail::decode_source(source),
        MediaKind::Video => {
            let bytes = frame::extract_frame(ffmpeg, source)?;
            image::load_from_memory(&bytes)
                .map_err(|e| AppError::Generation(format!("frame decode failed: {}", e)))
        }
    }
}

fn into_generation(err: AppError) -> AppError {
    match err {
        AppError::Generation(_) => err,
        other => AppError::Generation(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    const STUB_FFMPEG: &str = r#"#!/bin/sh
here="$(dirname "$0")"
for last; do :; done
if [ "$last" = "pipe:" ]; then
    echo frame >> "$here/calls.log"
    cat "$here/frame.jpg"
    exit 0
fi
echo transcode >> "$here/calls.log"
sleep 0.3
if [ -f "$here/fail" ]; then
    echo "encoder exploded" >&2
    exit 1
fi
printf '#EXTM3U\n#EXTINF:1.0,\nindex0.ts\n#EXT-X-ENDLIST\n' > "$last"
printf 'ts' > "$(dirname "$last")/index0.ts"
"#;

    /// An ffmpeg stand-in in `dir`. Frame grabs print a fixed JPEG, transcodes
    /// write a finished playlist, or fail when `fail` is set. Each call is
    /// logged to `dir/calls.log`.
    #[cfg(unix)]
    pub(crate) fn stub_ffmpeg(dir: &Path, fail: bool) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        RgbImage::from_pixel(300, 200, Rgb([40, 90, 160]))
            .save(dir.join("frame.jpg"))
            .expect("frame");
        if fail {
            std::fs::write(dir.join("fail"), b"").expect("fail marker");
        }
        let path = dir.join("ffmpeg");
        std::fs::write(&path, STUB_FFMPEG).expect("script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    /// How many transcodes the stub in `dir` has run.
    pub(crate) fn transcode_calls(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("calls.log"))
            .map(|log| log.lines().filter(|line| *line == "transcode").count())
            .unwrap_or(0)
    }

    fn pipeline_with(dir: &Path, configure: impl FnOnce(&mut Config)) -> (Arc<Database>, AssetPipeline) {
        let media = dir.join("media");
        std::fs::create_dir_all(&media).expect("media dir");
        let mut config = Config::new(&media, dir.join("data"));
        configure(&mut config);
        let db = Arc::new(Database::new(config.database_path()).expect("db"));
        let pipeline = AssetPipeline::new(db.clone(), &config);
        (db, pipeline)
    }

    fn pipeline(dir: &Path) -> (Arc<Database>, AssetPipeline) {
        pipeline_with(dir, |_| {})
    }

    fn image_record(dir: &Path, rel: &str, width: u32, height: u32) -> MediaRecord {
        let path = dir.join("media").join(rel);
        RgbImage::from_pixel(width, height, Rgb([200, 10, 10]))
            .save(&path)
            .expect("save");
        let mut record = MediaRecord::new(rel, MediaKind::Image);
        record.set_dimensions(width, height);
        record
    }

    #[test]
    fn test_paths() {
        let root = Path::new("/cache");
        assert_eq!(thumbnail_path(root, 400, 7), PathBuf::from("/cache/400/7.jpg"));
        assert_eq!(hls_index_path(root, 7), PathBuf::from("/cache/video/7/index.m3u8"));
    }

    #[tokio::test]
    async fn test_pregenerate_writes_ladder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_db, pipeline) = pipeline(dir.path());
        let record = image_record(dir.path(), "a.png", 450, 300);

        let written = pipeline.pregenerate(&record, None, false).await.expect("pregenerate");
        assert_eq!(written, 3);
        assert!(pipeline.missing_sizes(&record).is_empty());

        let thumb = image::open(thumbnail_path(pipeline.cache_root(), 400, record.id)).expect("open");
        assert_eq!(thumb.dimensions(), (400, 267));

        assert_eq!(pipeline.pregenerate(&record, None, false).await.expect("again"), 0);
        assert_eq!(pipeline.pregenerate(&record, None, true).await.expect("regen"), 3);

        AssetPipeline::remove_thumbnails(pipeline.cache_root(), &record);
        assert_eq!(pipeline.missing_sizes(&record), vec![200, 400, 450]);
    }

    #[tokio::test]
    async fn test_generate_from_raster() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_db, pipeline) = pipeline(dir.path());
        let mut record = MediaRecord::new("not-on-disk.jpg", MediaKind::Image);
        record.set_dimensions(300, 300);
        let raster = Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 300, Rgb([0, 0, 0]))));

        pipeline.generate(&record, 200, Some(raster)).await.expect("generate");
        assert!(thumbnail_path(pipeline.cache_root(), 200, record.id).is_file());

        let err = pipeline.generate(&record, 300, None).await.expect_err("source missing");
        assert!(matches!(err, AppError::Generation(_)));
    }

    #[tokio::test]
    async fn test_thumbnail_lookup_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_db, pipeline) = pipeline(dir.path());
        assert!(matches!(
            pipeline.thumbnail(12345, 200).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            pipeline.hls_file(1, "../etc/passwd").await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_transcodes_run_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = tempfile::tempdir().expect("tools");
        let ffmpeg = stub_ffmpeg(tools.path(), false);
        let (_db, pipeline) = pipeline_with(dir.path(), |config| config.ffmpeg = ffmpeg);
        let record = MediaRecord::new("clip.mov", MediaKind::Video);
        let index = hls_index_path(pipeline.cache_root(), record.id);

        let (first, second) = tokio::join!(
            pipeline.transcode_record(&record),
            pipeline.transcode_record(&record)
        );
        assert_eq!(first.expect("first"), index);
        assert_eq!(second.expect("second"), index);
        assert_eq!(transcode_calls(tools.path()), 1);

        assert_eq!(pipeline.transcode_record(&record).await.expect("reuse"), index);
        assert_eq!(transcode_calls(tools.path()), 1);

        AssetPipeline::remove_transcode(pipeline.cache_root(), &record);
        assert!(!hls_dir(pipeline.cache_root(), record.id).exists());
        pipeline.transcode_record(&record).await.expect("redo");
        assert_eq!(transcode_calls(tools.path()), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_transcode_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = tempfile::tempdir().expect("tools");
        let ffmpeg = stub_ffmpeg(tools.path(), true);
        let (_db, pipeline) = pipeline_with(dir.path(), |config| config.ffmpeg = ffmpeg);
        let record = MediaRecord::new("clip.mov", MediaKind::Video);

        let err = pipeline.transcode_record(&record).await.expect_err("stub fails");
        assert!(matches!(&err, AppError::Generation(msg) if msg.contains("encoder exploded")));
        assert!(!hls_dir(pipeline.cache_root(), record.id).exists());

        let image = MediaRecord::new("a.jpg", MediaKind::Image);
        assert!(matches!(
            pipeline.transcode_record(&image).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
