use crate::assets::AssetPipeline;
use crate::cache::ResponseCache;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::model::{format_date, MediaRecord};
use rusqlite::{params, ErrorCode, Transaction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Attempts per write transaction before lock contention becomes fatal.
pub const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Every index mutation goes through here: one transaction per media item,
/// folder and tag rows kept in step with their references, and a full
/// response-cache flush after each successful write.
pub struct IndexWriter {
    db: Arc<Database>,
    cache: ResponseCache,
    cache_root: PathBuf,
}

impl IndexWriter {
    pub fn new(db: Arc<Database>, cache: ResponseCache, cache_root: PathBuf) -> Self {
        Self {
            db,
            cache,
            cache_root,
        }
    }

    /// Runs `op` in a transaction, retrying the whole thing while SQLite
    /// reports the database busy or locked.
    fn with_retry<T, F>(&self, what: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut attempt = 1;
        loop {
            let result = {
                let mut conn = self.db.get_conn()?;
                conn.transaction().and_then(|tx| {
                    let value = op(&tx)?;
                    tx.commit()?;
                    Ok(value)
                })
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < MAX_ATTEMPTS => {
                    log::warn!(
                        "Database busy during {} (attempt {}/{}), retrying",
                        what,
                        attempt,
                        MAX_ATTEMPTS
                    );
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(AppError::Persistence(format!(
                        "{} failed after {} attempt(s): {}",
                        what, attempt, e
                    )))
                }
            }
        }
    }

    /// Inserts a record with its folder, tags and search row.
    pub fn upsert(&self, record: &MediaRecord) -> AppResult<()> {
        reject_undated(record)?;
        self.with_retry("insert", |tx| insert_in_tx(tx, record))?;
        log::debug!("Indexed {}", record.path);
        self.cache.flush();
        Ok(())
    }

    /// Replaces `old` with `new` in one transaction: a delete then an insert.
    pub fn replace(&self, old: &MediaRecord, new: &MediaRecord) -> AppResult<()> {
        reject_undated(new)?;
        self.with_retry("update", |tx| {
            delete_in_tx(tx, old)?;
            insert_in_tx(tx, new)
        })?;
        log::debug!("Re-indexed {}", new.path);
        self.cache.flush();
        Ok(())
    }

    /// Removes a record and collects folder/tag rows nothing references
    /// anymore. Optionally drops its thumbnails too.
    pub fn delete(&self, path: &str, record: &MediaRecord, remove_thumbnails: bool) -> AppResult<()> {
        if path != record.path {
            return Err(AppError::InvalidInput(format!(
                "delete path {} does not match record {}",
                path, record.path
            )));
        }
        self.with_retry("delete", |tx| delete_in_tx(tx, record))?;
        if remove_thumbnails {
            AssetPipeline::remove_thumbnails(&self.cache_root, record);
        }
        log::debug!("Removed {}", record.path);
        self.cache.flush();
        Ok(())
    }

    /// Remembers that `path` failed at `at`, replacing any earlier failure.
    pub fn track_scan_error(&self, path: &str, at: OffsetDateTime, err: &AppError) -> AppResult<()> {
        let at = at
            .format(&Rfc3339)
            .map_err(|e| AppError::InvalidInput(format!("bad timestamp: {}", e)))?;
        let message = err.to_string();
        self.with_retry("scan error", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO scan_errors (path, modified, error) VALUES (?1, ?2, ?3)",
                params![path, at, message],
            )
        })?;
        Ok(())
    }
}

fn reject_undated(record: &MediaRecord) -> AppResult<()> {
    if !record.has_date() {
        return Err(AppError::DateResolution(format!(
            "refusing to index {} without a date",
            record.path
        )));
    }
    Ok(())
}

fn insert_in_tx(tx: &Transaction<'_>, record: &MediaRecord) -> rusqlite::Result<()> {
    let folder = crate::model::Folder::new(&record.folder);
    tx.execute(
        "INSERT OR IGNORE INTO folders (id, key) VALUES (?1, ?2)",
        params![folder.id, folder.key],
    )?;

    for tag in &record.subject {
        tx.execute(
            "INSERT OR IGNORE INTO tags (id, key, value) VALUES (?1, ?2, ?3)",
            params![tag.id, tag.key, tag.value],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO images_tags (image_id, tag_id) VALUES (?1, ?2)",
            params![record.id, tag.id],
        )?;
    }

    let subject = serde_json::to_string(&record.subject)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    tx.execute(
        "INSERT OR REPLACE INTO media (
            hash, path, subject, width, height, ratio, padding, date, modified, folder,
            rating, shutterspeed, aperture, iso, lens, camera, focallength, altitude,
            latitude, longitude, mediatype, focusdistance, focallength35, color, location,
            description, title, software, \"offset\", rotation
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30
        )",
        params![
            record.id,
            record.path,
            subject,
            record.width,
            record.height,
            record.ratio,
            record.padding,
            format_date(record.date),
            format_date(record.modified),
            record.folder,
            record.rating,
            record.shutter_speed,
            record.aperture,
            record.iso,
            record.lens,
            record.camera,
            record.focal_length,
            record.altitude,
            record.latitude,
            record.longitude,
            record.media_type.as_str(),
            record.focus_distance,
            record.focal_length_35,
            record.color,
            record.location,
            record.description,
            record.title,
            record.software,
            record.offset,
            record.rotation,
        ],
    )?;

    let tag_text = record
        .subject
        .iter()
        .map(|t| t.value.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    tx.execute("DELETE FROM images_virtual WHERE hash = ?1", params![record.id])?;
    tx.execute(
        "INSERT INTO images_virtual (hash, path, subject, camera, lens, location, description, title, folder)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.path,
            tag_text,
            record.camera,
            record.lens,
            record.location,
            record.description,
            record.title,
            record.folder,
        ],
    )?;

    tx.execute("DELETE FROM scan_errors WHERE path = ?1", params![record.path])?;
    Ok(())
}

fn delete_in_tx(tx: &Transaction<'_>, record: &MediaRecord) -> rusqlite::Result<()> {
    let tag_ids: Vec<u32> = {
        let mut stmt = tx.prepare("SELECT tag_id FROM images_tags WHERE image_id = ?1")?;
        let rows = stmt.query_map(params![record.id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<u32>>>()?
    };

    tx.execute("DELETE FROM images_tags WHERE image_id = ?1", params![record.id])?;
    tx.execute("DELETE FROM media WHERE hash = ?1", params![record.id])?;
    tx.execute("DELETE FROM images_virtual WHERE hash = ?1", params![record.id])?;

    for tag_id in tag_ids {
        tx.execute(
            "DELETE FROM tags WHERE id = ?1
             AND NOT EXISTS (SELECT 1 FROM images_tags WHERE tag_id = ?1)",
            params![tag_id],
        )?;
    }

    tx.execute(
        "DELETE FROM folders WHERE key = ?1
         AND NOT EXISTS (SELECT 1 FROM media WHERE folder = ?1)",
        params![record.folder],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{MediaKind, Tag, NO_DATE};
    use time::macros::datetime;

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub db: Arc<Database>,
        pub cache: ResponseCache,
        pub writer: IndexWriter,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(dir.path().join("index.db")).expect("db"));
        let cache = ResponseCache::new(100, false);
        let writer = IndexWriter::new(db.clone(), cache.clone(), dir.path().join("cache"));
        Fixture {
            dir,
            db,
            cache,
            writer,
        }
    }

    pub(crate) fn record(path: &str, date: OffsetDateTime, tags: &[&str]) -> MediaRecord {
        let mut r = MediaRecord::new(path, MediaKind::Image);
        r.date = date;
        r.modified = datetime!(2024-01-01 0:00 UTC);
        r.set_dimensions(1000, 750);
        r.subject = tags.iter().map(|t| Tag::new(t)).collect();
        r
    }

    #[test]
    fn test_upsert_and_read_back() {
        let f = fixture();
        let mut r = record("2023/trip/a.jpg", datetime!(2023-09-24 14:21:48.5 UTC), &["Beach"]);
        r.camera = "X100V".into();
        r.offset = 120;
        f.writer.upsert(&r).expect("upsert");

        let stored = f.db.media_by_id(r.id).expect("lookup").expect("present");
        assert_eq!(stored, r);
        assert_eq!(f.db.count("folders").expect("count"), 1);
        assert_eq!(f.db.count("tags").expect("count"), 1);
        assert_eq!(f.db.count("images_tags").expect("count"), 1);
        assert_eq!(f.db.count("images_virtual").expect("count"), 1);
    }

    #[test]
    fn test_rejects_sentinel_date() {
        let f = fixture();
        let r = record("a.jpg", NO_DATE, &[]);
        assert!(matches!(f.writer.upsert(&r), Err(AppError::DateResolution(_))));
        assert_eq!(f.db.count("media").expect("count"), 0);
        assert_eq!(f.db.count("folders").expect("count"), 0);
    }

    #[test]
    fn test_delete_restores_folder_and_tag_tables() {
        let f = fixture();
        let sibling = record("2023/a.jpg", datetime!(2023-01-01 0:00 UTC), &["Beach"]);
        f.writer.upsert(&sibling).expect("sibling");

        let folders_before = f.db.count("folders").expect("count");
        let tags_before = f.db.count("tags").expect("count");

        let r = record("2024/b.jpg", datetime!(2024-01-01 0:00 UTC), &["Beach", "Snow"]);
        f.writer.upsert(&r).expect("upsert");
        assert_eq!(f.db.count("folders").expect("count"), folders_before + 1);
        assert_eq!(f.db.count("tags").expect("count"), tags_before + 1);

        f.writer.delete(&r.path, &r, false).expect("delete");
        assert_eq!(f.db.count("folders").expect("count"), folders_before);
        assert_eq!(f.db.count("tags").expect("count"), tags_before);
        assert_eq!(f.db.count("images_tags").expect("count"), 1);
        assert_eq!(f.db.count("images_virtual").expect("count"), 1);

        f.writer.delete(&sibling.path, &sibling, false).expect("delete sibling");
        for table in ["media", "folders", "tags", "images_tags", "images_virtual"] {
            assert_eq!(f.db.count(table).expect("count"), 0, "{}", table);
        }
    }

    #[test]
    fn test_delete_path_mismatch() {
        let f = fixture();
        let r = record("a.jpg", datetime!(2023-01-01 0:00 UTC), &[]);
        assert!(matches!(
            f.writer.delete("b.jpg", &r, false),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_replace_swaps_tags() {
        let f = fixture();
        let old = record("a.jpg", datetime!(2023-01-01 0:00 UTC), &["Old"]);
        f.writer.upsert(&old).expect("upsert");

        let new = record("a.jpg", datetime!(2023-01-02 0:00 UTC), &["New"]);
        f.writer.replace(&old, &new).expect("replace");

        let stored = f.db.media_by_id(new.id).expect("lookup").expect("present");
        assert_eq!(stored.date, new.date);
        assert_eq!(stored.subject[0].key, "new");
        assert_eq!(f.db.count("tags").expect("count"), 1);
    }

    #[test]
    fn test_write_flushes_cache() {
        let f = fixture();
        f.cache.insert("k".to_string(), b"stale".to_vec());
        let r = record("a.jpg", datetime!(2023-01-01 0:00 UTC), &[]);
        f.writer.upsert(&r).expect("upsert");
        assert_eq!(f.cache.check("k", None), crate::cache::Lookup::Miss);
    }

    #[test]
    fn test_scan_error_cleared_by_success() {
        let f = fixture();
        let at = datetime!(2024-05-01 10:00 UTC);
        f.writer
            .track_scan_error("a.jpg", at, &AppError::Extraction("bad".into()))
            .expect("track");
        let errors = f.db.scan_errors().expect("errors");
        assert_eq!(errors["a.jpg"].modified, at);
        assert!(errors["a.jpg"].error.contains("bad"));

        let r = record("a.jpg", datetime!(2023-01-01 0:00 UTC), &[]);
        f.writer.upsert(&r).expect("upsert");
        assert!(f.db.scan_errors().expect("errors").is_empty());
    }

    #[test]
    fn test_busy_detection() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_busy(&busy));
        assert!(!is_busy(&rusqlite::Error::QueryReturnedNoRows));
    }
}
