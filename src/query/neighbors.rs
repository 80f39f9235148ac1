use super::{FilterParams, QueryEngine};
use crate::errors::AppResult;
use crate::model::{format_date, parse_date, MediaKind, MediaRecord};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use time::OffsetDateTime;

/// How many newer items the viewer preloads.
pub const PREVIOUS_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub hash: u32,
    pub color: String,
    pub mediatype: MediaKind,
    pub path: String,
    pub width: u32,
    pub height: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

impl QueryEngine {
    /// Up to `limit` items captured strictly before `current`, newest first.
    /// `exclude` holds ids the caller already shows.
    pub fn next(
        &self,
        current: &MediaRecord,
        limit: usize,
        exclude: &[u32],
        params: &FilterParams,
    ) -> AppResult<Vec<Neighbor>> {
        let mut predicate = self.predicate(params);
        predicate.push("m.date < ?", [Value::Text(format_date(current.date))]);
        predicate.push("m.hash != ?", [Value::Integer(current.id as i64)]);
        predicate.push_not_in("m.hash", exclude.iter().map(|&id| Value::Integer(id as i64)));

        let sql = format!(
            "SELECT m.hash, m.color, m.mediatype, m.path, m.width, m.height, m.date {} \
             GROUP BY m.date ORDER BY m.date DESC LIMIT ?",
            predicate.sql()
        );
        let bound = predicate.params_with([Value::Integer(limit as i64)]);
        let conn = self.db.read_conn()?;
        query_neighbors(&conn, &sql, &bound)
    }

    /// Up to three items captured strictly after `current`, returned newest
    /// first so they read in timeline order.
    pub fn previous(
        &self,
        current: &MediaRecord,
        exclude: &[u32],
        params: &FilterParams,
    ) -> AppResult<Vec<Neighbor>> {
        let mut predicate = self.predicate(params);
        predicate.push("m.date > ?", [Value::Text(format_date(current.date))]);
        predicate.push("m.hash != ?", [Value::Integer(current.id as i64)]);
        predicate.push_not_in("m.hash", exclude.iter().map(|&id| Value::Integer(id as i64)));

        let sql = format!(
            "SELECT m.hash, m.color, m.mediatype, m.path, m.width, m.height, m.date {} \
             GROUP BY m.date ORDER BY m.date ASC LIMIT ?",
            predicate.sql()
        );
        let bound = predicate.params_with([Value::Integer(PREVIOUS_LIMIT as i64)]);
        let conn = self.db.read_conn()?;
        let mut items = query_neighbors(&conn, &sql, &bound)?;
        items.reverse();
        Ok(items)
    }
}

pub(super) fn query_neighbors(conn: &Connection, sql: &str, bound: &[Value]) -> AppResult<Vec<Neighbor>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(bound.iter()), |row| {
        let kind: String = row.get(2)?;
        let date: String = row.get(6)?;
        Ok((
            Neighbor {
                hash: row.get(0)?,
                color: row.get(1)?,
                mediatype: MediaKind::parse(&kind).unwrap_or(MediaKind::Image),
                path: row.get(3)?,
                width: row.get(4)?,
                height: row.get(5)?,
                date: OffsetDateTime::UNIX_EPOCH,
            },
            date,
        ))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (mut item, date) = row?;
        item.date = parse_date(&date)?;
        items.push(item);
    }
    Ok(items)
}
