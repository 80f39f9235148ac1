use crate::errors::{AppError, AppResult};
use crate::model::{
    parse_date, MediaKind, MediaRecord, ScanError, Tag, NO_DATE_STRING,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Read-only connections kept open alongside the writer.
pub const READ_POOL_SIZE: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Column list shared by every query that materializes a full `MediaRecord`.
pub const MEDIA_COLUMNS: &str = "m.hash, m.path, m.subject, m.width, m.height, m.ratio, m.padding, \
     m.date, m.modified, m.folder, m.rating, m.shutterspeed, m.aperture, m.iso, m.lens, m.camera, \
     m.focallength, m.altitude, m.latitude, m.longitude, m.mediatype, m.focusdistance, \
     m.focallength35, m.color, m.location, m.description, m.title, m.software, m.\"offset\", m.rotation";

/// The index store: one read-write connection for the writer and a small
/// round-robin pool of read-only connections for queries. WAL journaling lets
/// readers proceed while a write transaction is open.
pub struct Database {
    conn: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: PathBuf,
}

fn lock_conn<'a>(m: &'a Mutex<Connection>) -> AppResult<MutexGuard<'a, Connection>> {
    m.lock().map_err(|e| {
        log::warn!("Recovering from poisoned database mutex");
        AppError::Persistence(format!("Mutex poisoned: {}", e))
    })
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        log::debug!("Database journal mode: {}", mode);

        Self::migrate(&conn)?;

        let mut readers = Vec::with_capacity(READ_POOL_SIZE);
        for _ in 0..READ_POOL_SIZE {
            let reader = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            conn: Mutex::new(conn),
            readers,
            next_reader: AtomicUsize::new(0),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The read-write connection.
    pub fn get_conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        lock_conn(&self.conn)
    }

    /// A read-only connection. Prefers an idle one, otherwise waits on the
    /// next one in rotation.
    pub fn read_conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        for reader in &self.readers {
            if let Ok(guard) = reader.try_lock() {
                return Ok(guard);
            }
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        lock_conn(&self.readers[idx])
    }

    fn migrate(conn: &Connection) -> AppResult<()> {
        let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        log::info!("Database schema version: {}", version);

        if version < 1 {
            conn.execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS media (
                    hash INTEGER PRIMARY KEY,
                    path TEXT NOT NULL UNIQUE,
                    subject TEXT NOT NULL DEFAULT '[]',  -- JSON list of tags
                    width INTEGER NOT NULL DEFAULT 0,
                    height INTEGER NOT NULL DEFAULT 0,
                    ratio REAL NOT NULL DEFAULT 0,
                    padding REAL NOT NULL DEFAULT 0,
                    date TEXT NOT NULL,                  -- UTC, millisecond precision
                    modified TEXT NOT NULL,
                    folder TEXT NOT NULL,
                    rating INTEGER NOT NULL DEFAULT 0,
                    shutterspeed TEXT NOT NULL DEFAULT '',
                    aperture REAL NOT NULL DEFAULT 0,
                    iso INTEGER NOT NULL DEFAULT 0,
                    lens TEXT NOT NULL DEFAULT '',
                    camera TEXT NOT NULL DEFAULT '',
                    focallength REAL NOT NULL DEFAULT 0,
                    altitude REAL NOT NULL DEFAULT 0,
                    latitude REAL NOT NULL DEFAULT 0,
                    longitude REAL NOT NULL DEFAULT 0,
                    mediatype TEXT NOT NULL,
                    focusdistance REAL NOT NULL DEFAULT 0,
                    focallength35 REAL NOT NULL DEFAULT 0,
                    color TEXT NOT NULL DEFAULT '',
                    location TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    title TEXT NOT NULL DEFAULT '',
                    software TEXT NOT NULL DEFAULT '',
                    \"offset\" INTEGER NOT NULL DEFAULT 0,  -- minutes east of UTC
                    rotation INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_media_date ON media(date);
                CREATE INDEX IF NOT EXISTS idx_media_modified ON media(modified);
                CREATE INDEX IF NOT EXISTS idx_media_folder ON media(folder);

                CREATE TABLE IF NOT EXISTS folders (
                    id INTEGER PRIMARY KEY,
                    key TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id INTEGER PRIMARY KEY,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS images_tags (
                    image_id INTEGER NOT NULL,
                    tag_id INTEGER NOT NULL,
                    PRIMARY KEY (image_id, tag_id)
                );
                CREATE INDEX IF NOT EXISTS idx_images_tags_tag ON images_tags(tag_id);

                CREATE TABLE IF NOT EXISTS scan_errors (
                    path TEXT PRIMARY KEY,
                    modified TEXT NOT NULL,              -- RFC 3339
                    error TEXT NOT NULL
                );

                PRAGMA user_version = 1;
                COMMIT;",
            )?;
        }

        if version < 2 {
            // Migration 2: full-text index over the searchable columns
            conn.execute_batch(
                "BEGIN;
                 CREATE VIRTUAL TABLE IF NOT EXISTS images_virtual USING fts5(
                     hash UNINDEXED,
                     path,
                     subject,
                     camera,
                     lens,
                     location,
                     description,
                     title,
                     folder
                 );
                 PRAGMA user_version = 2;
                 COMMIT;",
            )?;
        }

        Ok(())
    }

    /// Every dated record. The change detector's snapshot.
    pub fn all_media(&self) -> AppResult<Vec<MediaRecord>> {
        let conn = self.read_conn()?;
        let sql = format!(
            "SELECT {} FROM media m WHERE m.date != ?1 ORDER BY m.path",
            MEDIA_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![NO_DATE_STRING], media_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn media_by_id(&self, id: u32) -> AppResult<Option<MediaRecord>> {
        let conn = self.read_conn()?;
        let sql = format!("SELECT {} FROM media m WHERE m.hash = ?1", MEDIA_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], media_from_row)
            .optional()?)
    }

    pub fn scan_errors(&self) -> AppResult<HashMap<String, ScanError>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare("SELECT path, modified, error FROM scan_errors")?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let modified: String = row.get(1)?;
            let error: String = row.get(2)?;
            Ok((path, modified, error))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (path, modified, error) = row?;
            let modified = match OffsetDateTime::parse(&modified, &Rfc3339) {
                Ok(ts) => ts,
                Err(e) => {
                    log::warn!("Ignoring scan error for {} with bad timestamp: {}", path, e);
                    continue;
                }
            };
            map.insert(
                path.clone(),
                ScanError {
                    path,
                    modified,
                    error,
                },
            );
        }
        Ok(map)
    }

    /// Row count of one of the index tables.
    pub fn count(&self, table: &str) -> AppResult<i64> {
        if !matches!(
            table,
            "media" | "folders" | "tags" | "images_tags" | "scan_errors" | "images_virtual"
        ) {
            return Err(AppError::InvalidInput(format!("unknown table: {}", table)));
        }
        let conn = self.read_conn()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }
}

fn conversion_error(idx: usize, err: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
    )
}

/// Maps a row selected with [`MEDIA_COLUMNS`].
pub fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    let subject: String = row.get(2)?;
    let subject: Vec<Tag> = serde_json::from_str(&subject).unwrap_or_default();
    let date: String = row.get(7)?;
    let modified: String = row.get(8)?;
    let media_type: String = row.get(20)?;

    Ok(MediaRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        subject,
        width: row.get(3)?,
        height: row.get(4)?,
        ratio: row.get(5)?,
        padding: row.get(6)?,
        date: parse_date(&date).map_err(|e| conversion_error(7, e))?,
        modified: parse_date(&modified).map_err(|e| conversion_error(8, e))?,
        folder: row.get(9)?,
        rating: row.get(10)?,
        shutter_speed: row.get(11)?,
        aperture: row.get(12)?,
        iso: row.get(13)?,
        lens: row.get(14)?,
        camera: row.get(15)?,
        focal_length: row.get(16)?,
        altitude: row.get(17)?,
        latitude: row.get(18)?,
        longitude: row.get(19)?,
        media_type: MediaKind::parse(&media_type).unwrap_or(MediaKind::Image),
        focus_distance: row.get(21)?,
        focal_length_35: row.get(22)?,
        color: row.get(23)?,
        location: row.get(24)?,
        description: row.get(25)?,
        title: row.get(26)?,
        software: row.get(27)?,
        offset: row.get(28)?,
        rotation: row.get(29)?,
    })
}
