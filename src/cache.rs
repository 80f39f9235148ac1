use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use time::{Date, OffsetDateTime};

/// Entries would go stale at the next day boundary anyway; this bounds how
/// long yesterday's keys stay resident.
const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The client already holds this version.
    NotModified { etag: String },
    Hit(Arc<CachedResponse>),
    Miss,
}

/// Serialized query results keyed by request, caller, filter and day. Any
/// index mutation flushes the whole cache.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<String, Arc<CachedResponse>>,
    dev: bool,
}

impl ResponseCache {
    pub fn new(capacity: u64, dev: bool) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ENTRY_TTL)
            .build();
        Self { inner, dev }
    }

    /// `url + user + fingerprint + YYYYMMDD`.
    pub fn key(url: &str, user: &str, fingerprint: &str, day: Date) -> String {
        format!(
            "{}|{}|{}|{:04}{:02}{:02}",
            url,
            user,
            fingerprint,
            day.year(),
            u8::from(day.month()),
            day.day()
        )
    }

    /// [`ResponseCache::key`] for the current UTC day.
    pub fn key_for_today(url: &str, user: &str, fingerprint: &str) -> String {
        Self::key(url, user, fingerprint, OffsetDateTime::now_utc().date())
    }

    pub fn check(&self, key: &str, if_none_match: Option<&str>) -> Lookup {
        match self.inner.get(key) {
            Some(entry) => {
                if !self.dev && etag_matches(&entry.etag, if_none_match) {
                    Lookup::NotModified {
                        etag: entry.etag.clone(),
                    }
                } else {
                    Lookup::Hit(entry)
                }
            }
            None => Lookup::Miss,
        }
    }

    pub fn insert(&self, key: String, body: Vec<u8>) -> Arc<CachedResponse> {
        let entry = Arc::new(CachedResponse {
            etag: etag_for(&body),
            body,
        });
        self.inner.insert(key, entry.clone());
        entry
    }

    /// Cached body for `key`, computing and storing it on a miss.
    pub fn get_or_insert_with<F, E>(
        &self,
        key: &str,
        if_none_match: Option<&str>,
        compute: F,
    ) -> Result<Lookup, E>
    where
        F: FnOnce() -> Result<Vec<u8>, E>,
    {
        match self.check(key, if_none_match) {
            Lookup::Miss => {
                let body = compute()?;
                let entry = self.insert(key.to_string(), body);
                if !self.dev && etag_matches(&entry.etag, if_none_match) {
                    Ok(Lookup::NotModified {
                        etag: entry.etag.clone(),
                    })
                } else {
                    Ok(Lookup::Hit(entry))
                }
            }
            found => Ok(found),
        }
    }

    /// Conditional check for static bytes (thumbnails, segments).
    pub fn check_static(&self, bytes: &[u8], if_none_match: Option<&str>) -> (String, bool) {
        let etag = etag_for(bytes);
        let not_modified = !self.dev && etag_matches(&etag, if_none_match);
        (etag, not_modified)
    }

    pub fn flush(&self) {
        self.inner.invalidate_all();
        log::debug!("Response cache flushed");
    }

    pub fn is_dev(&self) -> bool {
        self.dev
    }
}

/// Content hash used as the ETag value (unquoted).
pub fn etag_for(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Whether an `If-None-Match` header names `etag`. Handles lists, weak
/// validators and `*`.
pub fn etag_matches(etag: &str, if_none_match: Option<&str>) -> bool {
    let header = match if_none_match {
        Some(h) => h,
        None => return false,
    };
    let quoted = format!("\"{}\"", etag);
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*"
            || candidate == quoted
            || candidate.strip_prefix("W/") == Some(quoted.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_key_includes_day() {
        let a = ResponseCache::key("/api/timeline", "alice", "f1", date!(2026 - 10 - 19));
        let b = ResponseCache::key("/api/timeline", "alice", "f1", date!(2026 - 10 - 20));
        assert!(a.ends_with("20261019"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_conditional_hit() {
        let cache = ResponseCache::new(100, false);
        let entry = cache.insert("k".to_string(), b"{\"total\":1}".to_vec());
        let header = format!("\"{}\"", entry.etag);

        assert_eq!(
            cache.check("k", Some(&header)),
            Lookup::NotModified {
                etag: entry.etag.clone()
            }
        );
        assert_eq!(cache.check("k", Some("\"other\"")), Lookup::Hit(entry.clone()));
        assert_eq!(cache.check("k", None), Lookup::Hit(entry));
        assert_eq!(cache.check("missing", None), Lookup::Miss);
    }

    #[test]
    fn test_dev_mode_never_short_circuits() {
        let cache = ResponseCache::new(100, true);
        let entry = cache.insert("k".to_string(), b"body".to_vec());
        let header = format!("\"{}\"", entry.etag);
        assert_eq!(cache.check("k", Some(&header)), Lookup::Hit(entry));
        assert!(!cache.check_static(b"body", Some(&header)).1);
    }

    #[test]
    fn test_flush_drops_everything() {
        let cache = ResponseCache::new(100, false);
        cache.insert("a".to_string(), b"1".to_vec());
        cache.insert("b".to_string(), b"2".to_vec());
        cache.flush();
        assert_eq!(cache.check("a", None), Lookup::Miss);
        assert_eq!(cache.check("b", None), Lookup::Miss);
    }

    #[test]
    fn test_get_or_insert_with_computes_once() {
        let cache = ResponseCache::new(100, false);
        let mut calls = 0;
        let first: Result<Lookup, ()> = cache.get_or_insert_with("k", None, || {
            calls += 1;
            Ok(b"x".to_vec())
        });
        assert!(matches!(first, Ok(Lookup::Hit(_))));
        let second: Result<Lookup, ()> = cache.get_or_insert_with("k", None, || {
            calls += 1;
            Ok(b"y".to_vec())
        });
        match second {
            Ok(Lookup::Hit(entry)) => assert_eq!(entry.body, b"x".to_vec()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_etag_matches_forms() {
        assert!(etag_matches("abc", Some("\"abc\"")));
        assert!(etag_matches("abc", Some("W/\"abc\"")));
        assert!(etag_matches("abc", Some("\"x\", \"abc\"")));
        assert!(etag_matches("abc", Some("*")));
        assert!(!etag_matches("abc", Some("abc")));
        assert!(!etag_matches("abc", None));
    }
}
