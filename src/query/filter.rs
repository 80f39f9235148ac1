//! Filter parameters and the SQL predicate they compile to.

use super::aliases::LensAliases;
use crate::errors::{AppError, AppResult};
use crate::media_utils::slugify;
use crate::model::{format_date, MediaKind, NO_DATE_STRING};
use regex::Regex;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use time::OffsetDateTime;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKey {
    #[default]
    Date,
    Modified,
}

impl OrderKey {
    pub fn column(&self) -> &'static str {
        match self {
            OrderKey::Date => "m.date",
            OrderKey::Modified => "m.modified",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "date" => Ok(OrderKey::Date),
            "modified" => Ok(OrderKey::Modified),
            other => Err(AppError::InvalidInput(format!("unknown order key: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "" | "desc" => Ok(Direction::Desc),
            other => Err(AppError::InvalidInput(format!("unknown direction: {}", other))),
        }
    }
}

/// What the serving layer decoded from a request. Empty strings and `None`
/// mean "no constraint".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub rating: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    pub camera: String,
    pub lens: String,
    pub media_type: Option<MediaKind>,
    pub term: String,
    pub folder: String,
    pub subject: String,
    pub software: String,
    pub focal_length_35: Option<f64>,
    pub order_by: OrderKey,
    pub direction: Direction,
    pub page_size: usize,
    pub cursor: usize,
}

impl FilterParams {
    pub fn page_size(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    /// Stable digest of every field, for response cache keys.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&encoded).to_hex()[..16].to_string()
    }
}

fn strip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\p{L}\p{N} ]+").expect("term pattern compiles"))
}

/// Drops everything except letters, digits and spaces.
pub fn sanitize_term(input: &str) -> String {
    strip_pattern().replace_all(input, "").into_owned()
}

/// The sanitized term as an FTS5 query: every word quoted and
/// prefix-matched, all words required.
pub fn fts_query(input: &str) -> Option<String> {
    let cleaned = sanitize_term(input);
    let tokens: Vec<String> = cleaned
        .split_whitespace()
        .map(|word| format!("\"{}\"*", word))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// `FROM`/`JOIN`/`WHERE` fragment plus its positional parameters. Clauses
/// are ANDed in the order they were pushed; parameters follow the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    joins: Vec<&'static str>,
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Default for Predicate {
    fn default() -> Self {
        Self::new()
    }
}

impl Predicate {
    /// Every dated media row.
    pub fn new() -> Self {
        let mut predicate = Self {
            joins: Vec::new(),
            clauses: Vec::new(),
            params: Vec::new(),
        };
        predicate.push("m.date != ?", [Value::Text(NO_DATE_STRING.to_string())]);
        predicate
    }

    pub fn build(filter: &FilterParams, aliases: &LensAliases) -> Self {
        let mut p = Self::new();

        if let Some(query) = fts_query(&filter.term) {
            p.joins.push("JOIN images_virtual ON images_virtual.hash = m.hash");
            p.push("images_virtual MATCH ?", [Value::Text(query)]);
        }

        if !filter.subject.is_empty() {
            p.joins.push("JOIN images_tags it ON it.image_id = m.hash");
            p.joins.push("JOIN tags t ON t.id = it.tag_id");
            p.push("t.key = ?", [Value::Text(slugify(&filter.subject))]);
        }

        p.push("m.rating >= ?", [Value::Integer(filter.rating)]);

        if let Some(from) = filter.from {
            p.push("m.date >= ?", [Value::Text(format_date(from))]);
        }
        if let Some(to) = filter.to {
            p.push("m.date <= ?", [Value::Text(format_date(to))]);
        }
        if !filter.camera.is_empty() {
            p.push("m.camera = ?", [Value::Text(filter.camera.clone())]);
        }
        if !filter.lens.is_empty() {
            let variants = aliases.expand(&filter.lens);
            p.push_in("m.lens", variants.into_iter().map(Value::Text));
        }
        if !filter.folder.is_empty() {
            p.push("m.folder = ?", [Value::Text(filter.folder.clone())]);
        }
        if let Some(kind) = filter.media_type {
            p.push("m.mediatype = ?", [Value::Text(kind.as_str().to_string())]);
        }
        if !filter.software.is_empty() {
            p.push("m.software = ?", [Value::Text(filter.software.clone())]);
        }
        if let Some(focal) = filter.focal_length_35 {
            p.push("m.focallength35 = ?", [Value::Real(focal)]);
        }

        p
    }

    pub fn push<I>(&mut self, clause: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = Value>,
    {
        self.clauses.push(clause.into());
        self.params.extend(values);
    }

    /// `column IN (?, ?, ...)`. An empty list matches nothing.
    pub fn push_in<I>(&mut self, column: &str, values: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        if values.is_empty() {
            self.clauses.push("0".to_string());
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{} IN ({})", column, placeholders));
        self.params.extend(values);
    }

    /// `column NOT IN (...)`. An empty list is no constraint.
    pub fn push_not_in<I>(&mut self, column: &str, values: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().collect();
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{} NOT IN ({})", column, placeholders));
        self.params.extend(values);
    }

    pub fn sql(&self) -> String {
        let mut sql = String::from("FROM media m");
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.clauses.join(" AND "));
        }
        sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Parameters followed by `extra`, for statements that bind more
    /// placeholders after the WHERE clause (LIMIT, OFFSET).
    pub fn params_with(&self, extra: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut all = self.params.clone();
        all.extend(extra);
        all
    }
}
