//! Diffs the media tree against the indexed snapshot.

use crate::errors::{AppError, AppResult};
use crate::media_utils::{classify, is_hidden, relative_key};
use crate::metadata::file_modified;
use crate::model::{MediaKind, MediaRecord, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Only new, changed and removed files.
    Default,
    /// Every indexed file is re-extracted and its thumbnails rebuilt.
    Deep,
    /// Every indexed file is re-extracted; thumbnails are left alone.
    Metadata,
}

impl ScanMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "default" => Some(ScanMode::Default),
            "deep" => Some(ScanMode::Deep),
            "metadata" => Some(ScanMode::Metadata),
            _ => None,
        }
    }
}

/// Verdict for an already indexed record.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Deleted(MediaRecord),
    Modified {
        record: MediaRecord,
        regenerate_thumbs: bool,
    },
    Unchanged(MediaRecord),
}

/// A file found on disk that the index does not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    New {
        rel_path: String,
        abs_path: PathBuf,
        kind: MediaKind,
    },
    Unsupported(String),
    /// Failed before and unchanged since.
    Shielded(String),
}

fn check_canceled(cancel: &CancellationToken) -> AppResult<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Canceled);
    }
    Ok(())
}

/// Classifies every indexed record against the file under `root`.
pub fn reconcile(
    root: &Path,
    snapshot: &[MediaRecord],
    mode: ScanMode,
    cancel: &CancellationToken,
) -> AppResult<Vec<Change>> {
    let mut changes = Vec::with_capacity(snapshot.len());

    for record in snapshot {
        check_canceled(cancel)?;

        let path = root.join(&record.path);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                changes.push(Change::Deleted(record.clone()));
                continue;
            }
            Err(e) => {
                // Unreadable is not gone; keep the row until the file answers.
                log::warn!("Could not stat {}, leaving it indexed: {}", record.path, e);
                changes.push(Change::Unchanged(record.clone()));
                continue;
            }
        };

        let modified = match meta.modified() {
            Ok(m) => {
                let m = OffsetDateTime::from(m);
                m.replace_nanosecond(0).unwrap_or(m)
                    != record.modified.replace_nanosecond(0).unwrap_or(record.modified)
            }
            Err(e) => {
                log::warn!("No modification time for {}: {}", record.path, e);
                false
            }
        };

        let change = if modified {
            Change::Modified {
                record: record.clone(),
                regenerate_thumbs: true,
            }
        } else {
            match mode {
                ScanMode::Default => Change::Unchanged(record.clone()),
                ScanMode::Deep => Change::Modified {
                    record: record.clone(),
                    regenerate_thumbs: true,
                },
                ScanMode::Metadata => Change::Modified {
                    record: record.clone(),
                    regenerate_thumbs: false,
                },
            }
        };
        changes.push(change);
    }

    Ok(changes)
}

/// Walks `root` in sorted order and reports files missing from `indexed`.
pub fn discover(
    root: &Path,
    indexed: &HashSet<String>,
    scan_errors: &HashMap<String, ScanError>,
    cancel: &CancellationToken,
) -> AppResult<Vec<Discovery>> {
    let mut found = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry under {:?}: {}", root, e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        check_canceled(cancel)?;

        let path = entry.path();
        if is_hidden(path) {
            continue;
        }
        let rel_path = match relative_key(root, path) {
            Some(rel) => rel,
            None => continue,
        };
        if indexed.contains(&rel_path) {
            continue;
        }

        if let Some(previous) = scan_errors.get(&rel_path) {
            match file_modified(path) {
                Ok(mtime) if mtime < previous.modified => {
                    log::info!("Skipping {}: failed at {} and unchanged since", rel_path, previous.modified);
                    found.push(Discovery::Shielded(rel_path));
                    continue;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Could not stat {}: {}", rel_path, e),
            }
        }

        match classify(path) {
            Some(kind) => found.push(Discovery::New {
                rel_path,
                abs_path: path.to_path_buf(),
                kind,
            }),
            None => {
                log::info!("Skipping unsupported file {}", rel_path);
                found.push(Discovery::Unsupported(rel_path));
            }
        }
    }

    Ok(found)
}
