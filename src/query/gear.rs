use super::aliases::LensAliases;
use super::QueryEngine;
use crate::errors::{AppError, AppResult};
use crate::model::NO_DATE_STRING;
use rusqlite::params;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GearColumn {
    Camera,
    Lens,
    #[serde(rename = "focallength35")]
    FocalLength35,
    Software,
}

impl GearColumn {
    pub fn column(&self) -> &'static str {
        match self {
            GearColumn::Camera => "camera",
            GearColumn::Lens => "lens",
            GearColumn::FocalLength35 => "focallength35",
            GearColumn::Software => "software",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "camera" => Ok(GearColumn::Camera),
            "lens" => Ok(GearColumn::Lens),
            "focallength35" => Ok(GearColumn::FocalLength35),
            "software" => Ok(GearColumn::Software),
            other => Err(AppError::InvalidInput(format!("unknown gear column: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GearItem {
    pub name: String,
    pub total: i64,
}

impl QueryEngine {
    /// Item counts per distinct value of `column`, most used first. Lenses
    /// in one alias group are reported once under the group's name.
    pub fn gear(&self, column: GearColumn) -> AppResult<Vec<GearItem>> {
        let col = column.column();
        let sql = format!(
            "SELECT {col}, COUNT(*) AS total FROM media
             WHERE date != ?1
             GROUP BY {col}
             ORDER BY total DESC, {col} ASC"
        );

        let conn = self.db.read_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![NO_DATE_STRING], |row| {
            Ok((row.get::<_, Value>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (value, total) = row?;
            if let Some(name) = display_name(value) {
                items.push(GearItem { name, total });
            }
        }

        if column == GearColumn::Lens && !self.aliases.is_empty() {
            items = merge_lens_counts(items, &self.aliases);
        }
        Ok(items)
    }
}

/// Empty strings and zero focal lengths mean "unknown" and are left out.
fn display_name(value: Value) -> Option<String> {
    match value {
        Value::Text(text) if !text.trim().is_empty() => Some(text),
        Value::Real(v) if v > 0.0 => Some(format_number(v)),
        Value::Integer(v) if v > 0 => Some(v.to_string()),
        _ => None,
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Folds lens rows into their alias groups, summing the counts.
pub fn merge_lens_counts(items: Vec<GearItem>, aliases: &LensAliases) -> Vec<GearItem> {
    let mut totals: HashMap<String, i64> = HashMap::new();
    for item in items {
        *totals
            .entry(aliases.canonical(&item.name).to_string())
            .or_insert(0) += item.total;
    }

    let mut merged: Vec<GearItem> = totals
        .into_iter()
        .map(|(name, total)| GearItem { name, total })
        .collect();
    merged.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
    merged
}
