use super::{FilterParams, QueryEngine};
use crate::errors::AppResult;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineResponse {
    pub meta: Meta,
    pub timeline: Vec<DayCount>,
    pub photos: Vec<Photo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meta {
    /// Distinct capture timestamps under the filter.
    pub total: i64,
    #[serde(rename = "pagesize")]
    pub page_size: usize,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Distinct timestamps captured on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: String,
    pub count: i64,
}

/// Compact grid cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Photo {
    pub id: u32,
    pub w: u32,
    pub h: u32,
    pub c: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// `YYYY-MM-DD`
    pub d: String,
}

impl QueryEngine {
    pub fn timeline(&self, params: &FilterParams) -> AppResult<TimelineResponse> {
        let predicate = self.predicate(params);
        let from_where = predicate.sql();
        let page_size = params.page_size();
        let conn = self.db.read_conn()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(DISTINCT m.date) {}", from_where),
            params_from_iter(predicate.params()),
            |row| row.get(0),
        )?;

        let mut timeline = Vec::new();
        if params.cursor == 0 {
            let mut stmt = conn.prepare(&format!(
                "SELECT substr(m.date, 1, 10) AS day, COUNT(DISTINCT m.date) {} GROUP BY day ORDER BY day DESC",
                from_where
            ))?;
            let rows = stmt.query_map(params_from_iter(predicate.params()), |row| {
                Ok(DayCount {
                    date: row.get(0)?,
                    count: row.get(1)?,
                })
            })?;
            for row in rows {
                timeline.push(row?);
            }
        }

        let sql = format!(
            "SELECT m.hash, m.width, m.height, m.color, m.date, m.mediatype {} \
             GROUP BY m.date ORDER BY {} {} LIMIT ? OFFSET ?",
            from_where,
            params.order_by.column(),
            params.direction.as_sql()
        );
        let bound = predicate.params_with([
            Value::Integer(page_size as i64),
            Value::Integer(params.cursor as i64),
        ]);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound.iter()), |row| {
            let date: String = row.get(4)?;
            let kind: String = row.get(5)?;
            Ok(Photo {
                id: row.get(0)?,
                w: row.get(1)?,
                h: row.get(2)?,
                c: row.get(3)?,
                t: (kind == "video").then_some(kind),
                d: date.get(..10).unwrap_or(&date).to_string(),
            })
        })?;
        let mut photos = Vec::new();
        for row in rows {
            photos.push(row?);
        }

        let next = params.cursor + page_size;
        let next_cursor = (photos.len() >= page_size && (next as i64) < total).then(|| next.to_string());

        Ok(TimelineResponse {
            meta: Meta {
                total,
                page_size,
                next_cursor,
            },
            timeline,
            photos,
        })
    }
}
