//! Single-flight crawl coordinator and the thumbnail sweep.

use crate::assets::AssetPipeline;
use crate::config::Config;
use crate::database::Database;
use crate::detector::{self, Change, Discovery};
use crate::errors::{AppError, AppResult};
use crate::metadata::{Extracted, MetadataSource};
use crate::model::{MediaKind, MediaRecord};
use crate::notify::{emit, Notifier, Phase};
use crate::sizes::ladder_for;
use crate::writer::IndexWriter;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use crate::detector::ScanMode;

pub const ALREADY_RUNNING: &str = "scan already in progress";
const RECONCILE_CANCELED: &str = "Scan canceled while checking for modified and deleted items.";
const DISCOVERY_CANCELED: &str = "Scan canceled while checking for new items.";
const SWEEP_CANCELED: &str = "Thumbscan canceled.";
const RECOVERED: &str = "Scan encountered an error but will continue.";

/// How a run ended. Every variant carries the prose shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed { message: String },
    AlreadyRunning,
    Canceled { message: String },
    Failed { message: String },
}

impl ScanOutcome {
    pub fn message(&self) -> &str {
        match self {
            ScanOutcome::Completed { message }
            | ScanOutcome::Canceled { message }
            | ScanOutcome::Failed { message } => message,
            ScanOutcome::AlreadyRunning => ALREADY_RUNNING,
        }
    }
}

enum RunEnd {
    Finished(String),
    Canceled(&'static str),
}

#[derive(Default)]
struct RunState {
    in_progress: bool,
    cancel: Option<CancellationToken>,
    /// Bumped per run so a canceled run winding down cannot clear the state
    /// of a newer one.
    generation: u64,
}

/// Owns the in-progress flag and the active run's cancellation token. The
/// crawl and the thumbnail sweep share this guard.
pub struct Scanner {
    db: Arc<Database>,
    writer: Arc<IndexWriter>,
    source: Arc<dyn MetadataSource>,
    assets: Arc<AssetPipeline>,
    config: Arc<Config>,
    notifier: Notifier,
    state: Mutex<RunState>,
}

impl Scanner {
    pub fn new(
        db: Arc<Database>,
        writer: Arc<IndexWriter>,
        source: Arc<dyn MetadataSource>,
        assets: Arc<AssetPipeline>,
        config: Arc<Config>,
        notifier: Notifier,
    ) -> Self {
        Self {
            db,
            writer,
            source,
            assets,
            config,
            notifier,
            state: Mutex::new(RunState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("Recovering from poisoned scan state");
            poisoned.into_inner()
        })
    }

    fn begin(&self) -> Option<(u64, CancellationToken)> {
        let mut state = self.lock_state();
        if state.in_progress {
            return None;
        }
        let token = CancellationToken::new();
        state.in_progress = true;
        state.cancel = Some(token.clone());
        state.generation += 1;
        Some((state.generation, token))
    }

    fn finish(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.in_progress = false;
            state.cancel = None;
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock_state().in_progress
    }

    /// Cancels the active run, if any. The flag clears right away; the run
    /// itself stops at its next checkpoint.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock_state();
        match state.cancel.take() {
            Some(token) => {
                token.cancel();
                state.in_progress = false;
                log::info!("Scan canceled by user");
                true
            }
            None => false,
        }
    }

    pub fn spawn_scan(self: &Arc<Self>, mode: ScanMode) -> JoinHandle<ScanOutcome> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move { scanner.start(mode).await })
    }

    pub fn spawn_thumbnail_sweep(self: &Arc<Self>) -> JoinHandle<ScanOutcome> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move { scanner.start_thumbnail_sweep().await })
    }

    /// One full crawl: reconcile the index, then pick up new files.
    pub async fn start(&self, mode: ScanMode) -> ScanOutcome {
        let (generation, cancel) = match self.begin() {
            Some(run) => run,
            None => {
                log::info!("{}", ALREADY_RUNNING);
                emit(&self.notifier, "Scan already in progress.", Phase::Scanning);
                return ScanOutcome::AlreadyRunning;
            }
        };

        let result = AssertUnwindSafe(self.run_scan(mode, &cancel))
            .catch_unwind()
            .await;
        self.finish(generation);
        self.conclude(result)
    }

    /// Generates every missing ladder thumbnail.
    pub async fn start_thumbnail_sweep(&self) -> ScanOutcome {
        let (generation, cancel) = match self.begin() {
            Some(run) => run,
            None => {
                log::info!("Thumbscan already in progress");
                emit(&self.notifier, "Thumbscan already in progress.", Phase::Scanning);
                return ScanOutcome::AlreadyRunning;
            }
        };

        let result = AssertUnwindSafe(self.run_sweep(&cancel))
            .catch_unwind()
            .await;
        self.finish(generation);
        self.conclude(result)
    }

    fn conclude(&self, result: std::thread::Result<AppResult<RunEnd>>) -> ScanOutcome {
        match result {
            Ok(Ok(RunEnd::Finished(message))) => {
                log::info!("{}", message);
                emit(&self.notifier, message.clone(), Phase::Complete);
                ScanOutcome::Completed { message }
            }
            Ok(Ok(RunEnd::Canceled(message))) => {
                log::info!("{}", message);
                emit(&self.notifier, message, Phase::Canceled);
                ScanOutcome::Canceled {
                    message: message.to_string(),
                }
            }
            Ok(Err(e)) => {
                log::error!("Scan failed: {}", e);
                let message = format!("Scan failed: {}", e);
                emit(&self.notifier, message.clone(), Phase::Complete);
                ScanOutcome::Failed { message }
            }
            Err(_) => {
                log::error!("Recovered from panic in scanner");
                emit(&self.notifier, RECOVERED, Phase::Scanning);
                ScanOutcome::Failed {
                    message: RECOVERED.to_string(),
                }
            }
        }
    }

    async fn run_scan(&self, mode: ScanMode, cancel: &CancellationToken) -> AppResult<RunEnd> {
        let started = Instant::now();
        let root = self.config.media.clone();
        log::info!("Scanning media at {:?} ({:?} mode)", root, mode);
        emit(
            &self.notifier,
            format!("Scan started at {}.", root.display()),
            Phase::Scanning,
        );

        let snapshot = self.db.all_media()?;
        let scan_errors = self.db.scan_errors().unwrap_or_else(|e| {
            log::error!("Error loading scan errors: {}", e);
            HashMap::new()
        });
        let indexed: HashSet<String> = snapshot.iter().map(|r| r.path.clone()).collect();
        let mut failures = 0usize;

        log::info!("Checking for modified and deleted items...");
        let reconciled = {
            let root = root.clone();
            let cancel = cancel.clone();
            self.blocking_phase("reconcile", move || detector::reconcile(&root, &snapshot, mode, &cancel))
                .await
        };
        let changes = match reconciled {
            Some(Err(AppError::Canceled)) => return Ok(RunEnd::Canceled(RECONCILE_CANCELED)),
            Some(result) => result?,
            None => {
                failures += 1;
                Vec::new()
            }
        };

        for change in changes {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Canceled(RECONCILE_CANCELED));
            }
            match change {
                Change::Unchanged(_) => {}
                Change::Deleted(record) => {
                    let path = record.path.clone();
                    match self.write(move |w| w.delete(&record.path, &record, true)).await {
                        Ok(()) => {
                            log::info!("Removed item {}", path);
                            emit(&self.notifier, format!("Removed item: {}", path), Phase::Scanning);
                        }
                        Err(e) => {
                            log::error!("Error removing {}: {}", path, e);
                            failures += 1;
                        }
                    }
                }
                Change::Modified {
                    record,
                    regenerate_thumbs,
                } => match contain(&record.path, self.update(&root, &record, regenerate_thumbs)).await {
                    Ok(()) => {
                        emit(&self.notifier, format!("Updated media: {}", record.path), Phase::Scanning);
                    }
                    Err(e) => {
                        log::error!("Error updating {}: {}", record.path, e);
                        failures += 1;
                    }
                },
            }
        }

        log::info!("Checking for new items...");
        let discovered = {
            let root = root.clone();
            let cancel = cancel.clone();
            self.blocking_phase("discovery", move || {
                detector::discover(&root, &indexed, &scan_errors, &cancel)
            })
            .await
        };
        let discovered = match discovered {
            Some(Err(AppError::Canceled)) => return Ok(RunEnd::Canceled(DISCOVERY_CANCELED)),
            Some(result) => result?,
            None => {
                failures += 1;
                Vec::new()
            }
        };

        let mut unsupported = 0usize;
        for item in discovered {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Canceled(DISCOVERY_CANCELED));
            }
            match item {
                Discovery::New {
                    rel_path,
                    abs_path,
                    kind,
                } => match contain(&rel_path, self.add(kind, &rel_path, &abs_path)).await {
                    Ok(()) => {
                        let label = match kind {
                            MediaKind::Image => "image",
                            MediaKind::Video => "video",
                        };
                        emit(&self.notifier, format!("Added {}: {}", label, rel_path), Phase::Scanning);
                    }
                    Err(e) => {
                        log::error!("Error adding {}: {}", rel_path, e);
                        failures += 1;
                        let path = rel_path.clone();
                        let tracked = self
                            .write(move |w| w.track_scan_error(&path, OffsetDateTime::now_utc(), &e))
                            .await;
                        if let Err(track) = tracked {
                            log::error!("Error tracking scan error for {}: {}", rel_path, track);
                        }
                    }
                },
                Discovery::Unsupported(rel_path) => {
                    unsupported += 1;
                    emit(
                        &self.notifier,
                        format!("Skipped unsupported file: {}", rel_path),
                        Phase::Scanning,
                    );
                }
                Discovery::Shielded(rel_path) => {
                    emit(
                        &self.notifier,
                        format!("Skipped previously failed file: {}", rel_path),
                        Phase::Scanning,
                    );
                }
            }
        }

        let total = self.db.count("media").unwrap_or_else(|e| {
            log::error!("Error counting media: {}", e);
            0
        });
        Ok(RunEnd::Finished(scan_summary(
            total,
            started.elapsed(),
            unsupported,
            failures,
        )))
    }

    async fn add(&self, kind: MediaKind, rel_path: &str, abs_path: &Path) -> AppResult<()> {
        let Extracted { record, raster } = self.source.extract(kind, rel_path, abs_path).await?;
        let generated = self.thumbnails(&record, raster, false).await?;
        self.write(move |w| w.upsert(&record)).await?;
        log::info!("Added {} with {} thumbnails: {}", kind.as_str(), generated, rel_path);
        Ok(())
    }

    /// Re-extracts an indexed file and swaps the row. The old row stays if
    /// extraction fails.
    async fn update(&self, root: &Path, old: &MediaRecord, regenerate: bool) -> AppResult<()> {
        let abs_path: PathBuf = root.join(&old.path);
        let Extracted { record, raster } = self.source.extract(old.media_type, &old.path, &abs_path).await?;
        if regenerate {
            AssetPipeline::remove_thumbnails(self.assets.cache_root(), old);
            if old.is_video() {
                AssetPipeline::remove_transcode(self.assets.cache_root(), old);
            }
        }
        let generated = self.thumbnails(&record, raster, regenerate).await?;
        let (kind, path) = (record.media_type, record.path.clone());
        let previous = old.clone();
        self.write(move |w| w.replace(&previous, &record)).await?;
        log::info!("Updated {} with {} thumbnails: {}", kind.as_str(), generated, path);
        Ok(())
    }

    async fn thumbnails(
        &self,
        record: &MediaRecord,
        raster: Option<image::DynamicImage>,
        regenerate: bool,
    ) -> AppResult<usize> {
        if !(self.config.pregenerate_thumbs || regenerate) {
            return Ok(0);
        }
        let generated = self.assets.pregenerate(record, raster.map(Arc::new), regenerate).await?;
        if record.is_video() {
            self.assets.transcode_record(record).await?;
        }
        Ok(generated)
    }

    /// Index writes retry on a busy database with blocking sleeps, so they
    /// run off the async workers.
    async fn write<F>(&self, work: F) -> AppResult<()>
    where
        F: FnOnce(&IndexWriter) -> AppResult<()> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || work(&*writer))
            .await
            .map_err(|e| AppError::Persistence(format!("index write task failed: {}", e)))?
    }

    /// Runs one of the blocking tree walks. A walk that dies is logged and
    /// reported as `None`; the crawl moves on to its next phase.
    async fn blocking_phase<T, F>(&self, phase: &str, work: F) -> Option<AppResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        match tokio::task::spawn_blocking(work).await {
            Ok(result) => Some(result),
            Err(e) => {
                log::error!("Recovered from failed {} task: {}", phase, e);
                emit(&self.notifier, RECOVERED, Phase::Scanning);
                None
            }
        }
    }

    async fn run_sweep(&self, cancel: &CancellationToken) -> AppResult<RunEnd> {
        let started = Instant::now();
        log::info!("Scanning thumbs at {:?}", self.assets.cache_root());
        emit(&self.notifier, "Thumbscan started.", Phase::Scanning);

        let items = self.db.all_media()?;
        let mut checked = 0usize;
        let mut missing: Vec<(&MediaRecord, u32)> = Vec::new();
        for item in &items {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Canceled(SWEEP_CANCELED));
            }
            checked += ladder_for(item.width).len();
            for size in self.assets.missing_sizes(item) {
                missing.push((item, size));
            }
        }

        let status = format!("Generating {} missing thumbnails...", missing.len());
        log::info!("{}", status);
        emit(&self.notifier, status, Phase::Scanning);

        let mut errors = 0usize;
        for (idx, (record, size)) in missing.iter().enumerate() {
            if idx % 10 == 0 {
                emit(
                    &self.notifier,
                    format!("Generating thumbnails: {}/{}", idx, missing.len()),
                    Phase::Scanning,
                );
            }
            if cancel.is_cancelled() {
                return Ok(RunEnd::Canceled(SWEEP_CANCELED));
            }
            match self.assets.generate(record, *size, None).await {
                Ok(()) => log::info!("Thumbnail generated for {} at {}", record.path, size),
                Err(e) => {
                    log::error!("Error generating thumbnail for {}: {}", record.path, e);
                    errors += 1;
                }
            }
        }

        Ok(RunEnd::Finished(format!(
            "Scan complete. {} thumbnails checked in {}. {} missing. {} errors occurred.",
            checked,
            format_elapsed(started.elapsed()),
            missing.len(),
            errors
        )))
    }
}

/// Runs one item's work, turning a panic into an error for that item only.
async fn contain<F>(path: &str, work: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            log::error!("Recovered from panic while processing {}", path);
            Err(AppError::Extraction(format!("panic while processing {}", path)))
        }
    }
}

/// Final crawl status. Zero counts are left out.
fn scan_summary(total: i64, elapsed: Duration, unsupported: usize, failures: usize) -> String {
    let mut summary = format!(
        "Scan complete. {} media items scanned in {}.",
        total,
        format_elapsed(elapsed)
    );
    if unsupported > 0 {
        summary.push_str(&format!(" {} unsupported items skipped.", unsupported));
    }
    if failures > 0 {
        summary.push_str(&format!(" {} items with errors occurred during scan.", failures));
    }
    summary
}

/// Whole seconds as `1h2m3s`, `4m0s` or `5s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
