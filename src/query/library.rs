use super::neighbors::{query_neighbors, Neighbor};
use super::{Direction, FilterParams, QueryEngine};
use crate::errors::{AppError, AppResult};
use crate::model::{MediaRecord, Tag, NO_DATE_STRING};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use serde::Serialize;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

/// How far back "on this day" looks.
pub const MEMORY_YEARS: i32 = 20;
/// Previews per memory year.
pub const MEMORY_PREVIEWS: usize = 3;

const DAY_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Items captured on today's month and day, some years ago.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    /// Years before `today`.
    pub key: i32,
    /// `YYYY-MM-DD` of the remembered day.
    pub value: String,
    pub media: Vec<Neighbor>,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapPoint {
    pub hash: u32,
    pub latitude: f64,
    pub longitude: f64,
}

impl QueryEngine {
    pub fn media(&self, id: u32) -> AppResult<MediaRecord> {
        self.db
            .media_by_id(id)?
            .ok_or_else(|| AppError::NotFound(format!("media {}", id)))
    }

    /// Every tag, ordered by key.
    pub fn tags(&self, direction: Direction) -> AppResult<Vec<Tag>> {
        let conn = self.db.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, key, value FROM tags ORDER BY key {}",
            direction.as_sql()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(Tag {
                id: row.get(0)?,
                key: row.get(1)?,
                value: row.get(2)?,
            })
        })?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row?);
        }
        Ok(tags)
    }

    /// Media from the same month and day in each of the previous
    /// [`MEMORY_YEARS`] years, newest year first.
    pub fn memories(&self, today: Date) -> AppResult<Vec<Memory>> {
        let mut days = Vec::new();
        for years_ago in 1..=MEMORY_YEARS {
            // Feb 29 has no counterpart in common years.
            if let Ok(day) = today.replace_year(today.year() - years_ago) {
                if let Ok(formatted) = day.format(DAY_FORMAT) {
                    days.push(Value::Text(formatted));
                }
            }
        }
        if days.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; days.len()].join(", ");
        let sql = format!(
            "SELECT m.hash, m.color, m.mediatype, m.path, m.width, m.height, m.date
             FROM media m
             WHERE m.date != ? AND substr(m.date, 1, 10) IN ({})
             ORDER BY m.date DESC",
            placeholders
        );
        let mut bound = vec![Value::Text(NO_DATE_STRING.to_string())];
        bound.extend(days);

        let conn = self.db.read_conn()?;
        let items = query_neighbors(&conn, &sql, &bound)?;

        let mut memories: Vec<Memory> = Vec::new();
        for item in items {
            let year = item.date.year();
            match memories.last_mut() {
                Some(memory) if memory.key == today.year() - year => {
                    memory.total += 1;
                    if memory.media.len() < MEMORY_PREVIEWS {
                        memory.media.push(item);
                    }
                }
                _ => memories.push(Memory {
                    key: today.year() - year,
                    value: item.date.date().format(DAY_FORMAT).unwrap_or_default(),
                    media: vec![item],
                    total: 1,
                }),
            }
        }
        Ok(memories)
    }

    /// Geotagged items, one per capture timestamp.
    pub fn map_points(&self) -> AppResult<Vec<MapPoint>> {
        let conn = self.db.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT hash, latitude, longitude FROM media
             WHERE latitude != 0.0 AND longitude != 0.0 AND date != ?1
             GROUP BY date
             ORDER BY date DESC",
        )?;
        let rows = stmt.query_map(params![NO_DATE_STRING], |row| {
            Ok(MapPoint {
                hash: row.get(0)?,
                latitude: row.get(1)?,
                longitude: row.get(2)?,
            })
        })?;
        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }

    /// Number of items matching `params`.
    pub fn total(&self, params: &FilterParams) -> AppResult<i64> {
        let predicate = self.predicate(params);
        let conn = self.db.read_conn()?;
        Ok(conn.query_row(
            &format!("SELECT COUNT(DISTINCT m.hash) {}", predicate.sql()),
            params_from_iter(predicate.params()),
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::engine;
    use crate::writer::tests::{fixture, record};
    use time::macros::{date, datetime};

    #[test]
    fn test_media_lookup() {
        let f = fixture();
        let r = record("a.jpg", datetime!(2023-01-01 10:00 UTC), &[]);
        f.writer.upsert(&r).expect("upsert");
        let q = engine(&f);

        assert_eq!(q.media(r.id).expect("media"), r);
        assert!(matches!(q.media(r.id.wrapping_add(1)), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_tags_ordered() {
        let f = fixture();
        f.writer
            .upsert(&record("a.jpg", datetime!(2023-01-01 10:00 UTC), &["Zoo", "Beach Day"]))
            .expect("upsert");
        let q = engine(&f);

        let keys: Vec<String> = q.tags(Direction::Asc).expect("tags").into_iter().map(|t| t.key).collect();
        assert_eq!(keys, vec!["beach-day", "zoo"]);
        let desc = q.tags(Direction::Desc).expect("tags");
        assert_eq!(desc[0].value, "Zoo");
    }

    #[test]
    fn test_memories_group_by_year() {
        let f = fixture();
        let items = [
            ("last-year-a.jpg", datetime!(2025-10-19 08:00 UTC)),
            ("last-year-b.jpg", datetime!(2025-10-19 09:00 UTC)),
            ("older-1.jpg", datetime!(2021-10-19 08:00 UTC)),
            ("older-2.jpg", datetime!(2021-10-19 09:00 UTC)),
            ("older-3.jpg", datetime!(2021-10-19 10:00 UTC)),
            ("older-4.jpg", datetime!(2021-10-19 11:00 UTC)),
            ("wrong-day.jpg", datetime!(2024-10-20 08:00 UTC)),
            ("this-year.jpg", datetime!(2026-10-19 08:00 UTC)),
            ("too-old.jpg", datetime!(2005-10-19 08:00 UTC)),
        ];
        for (path, date) in items {
            f.writer.upsert(&record(path, date, &[])).expect("upsert");
        }

        let memories = engine(&f).memories(date!(2026-10-19)).expect("memories");
        assert_eq!(memories.len(), 2);

        assert_eq!(memories[0].key, 1);
        assert_eq!(memories[0].value, "2025-10-19");
        assert_eq!(memories[0].total, 2);
        assert_eq!(memories[0].media[0].path, "last-year-b.jpg");

        assert_eq!(memories[1].key, 5);
        assert_eq!(memories[1].total, 4);
        assert_eq!(memories[1].media.len(), 3);
    }

    #[test]
    fn test_memories_on_leap_day() {
        let f = fixture();
        f.writer
            .upsert(&record("leap.jpg", datetime!(2020-02-29 12:00 UTC), &[]))
            .expect("upsert");

        let memories = engine(&f).memories(date!(2024-02-29)).expect("memories");
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].key, 4);
    }

    #[test]
    fn test_map_points_dedupe_by_timestamp() {
        let f = fixture();
        let mut a = record("a.jpg", datetime!(2023-01-01 10:00 UTC), &[]);
        a.latitude = 52.37;
        a.longitude = 4.89;
        let mut b = record("b.jpg", datetime!(2023-01-01 10:00 UTC), &[]);
        b.latitude = 52.37;
        b.longitude = 4.89;
        let c = record("c.jpg", datetime!(2023-01-02 10:00 UTC), &[]);
        for r in [&a, &b, &c] {
            f.writer.upsert(r).expect("upsert");
        }

        let points = engine(&f).map_points().expect("map");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].latitude, 52.37);
        assert_eq!(points[0].longitude, 4.89);
    }

    #[test]
    fn test_total_counts_items_not_timestamps() {
        let f = fixture();
        f.writer
            .upsert(&record("a.jpg", datetime!(2023-01-01 10:00 UTC), &["Beach"]))
            .expect("upsert");
        f.writer
            .upsert(&record("b.jpg", datetime!(2023-01-01 10:00 UTC), &[]))
            .expect("upsert");
        let q = engine(&f);

        assert_eq!(q.total(&FilterParams::default()).expect("total"), 2);
        let beach = FilterParams {
            subject: "Beach".into(),
            ..Default::default()
        };
        assert_eq!(q.total(&beach).expect("total"), 1);
    }
}
