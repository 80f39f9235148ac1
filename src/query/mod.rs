//! Read side of the index: filtered timelines, neighbors, folder tree, gear
//! statistics and the smaller lookups a browsing UI needs.

pub mod aliases;
pub mod filter;
pub mod folders;
pub mod gear;
pub mod library;
pub mod neighbors;
pub mod timeline;

use crate::cache::{Lookup, ResponseCache};
use crate::config::Config;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use aliases::LensAliases;
use serde::Serialize;
use std::sync::Arc;

pub use filter::{Direction, FilterParams, OrderKey, Predicate};

pub struct QueryEngine {
    db: Arc<Database>,
    aliases: LensAliases,
}

impl QueryEngine {
    pub fn new(db: Arc<Database>, aliases: LensAliases) -> Self {
        Self { db, aliases }
    }

    pub fn from_config(db: Arc<Database>, config: &Config) -> Self {
        Self::new(db, LensAliases::new(&config.lens_aliases))
    }

    pub fn aliases(&self) -> &LensAliases {
        &self.aliases
    }

    fn predicate(&self, params: &FilterParams) -> Predicate {
        Predicate::build(params, &self.aliases)
    }

    /// Runs `compute` behind the response cache: a stored body for today's
    /// key is reused, and a matching `If-None-Match` short-circuits.
    pub fn cached<T, F>(
        &self,
        cache: &ResponseCache,
        url: &str,
        user: &str,
        params: &FilterParams,
        if_none_match: Option<&str>,
        compute: F,
    ) -> AppResult<Lookup>
    where
        T: Serialize,
        F: FnOnce(&Self) -> AppResult<T>,
    {
        let key = ResponseCache::key_for_today(url, user, &params.fingerprint());
        cache.get_or_insert_with(&key, if_none_match, || {
            let value = compute(self)?;
            serde_json::to_vec(&value)
                .map_err(|e| AppError::InvalidInput(format!("failed to serialize response: {}", e)))
        })
    }
}
