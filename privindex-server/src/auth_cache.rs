//! TTL caches of authentication decisions.
//!
//! Each backend instance owns two independent caches, one per [`AuthMode`],
//! keyed by secret hash. A decision older than the cache TTL is treated as
//! absent. A TTL of zero disables caching.
//!
//! A cache holds at most [`MAX_ENTRIES`] decisions. Storing into a full
//! cache first drops expired entries, then the oldest one. The index sync
//! task also purges expired entries on every tick.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

pub const MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    Read,
    Write,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Read => "read",
            AuthMode::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuthCacheEntry {
    pub passed: bool,
    pub checked_at: Instant,
}

#[derive(Debug)]
pub struct AuthCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, AuthCacheEntry>>,
}

impl AuthCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_max_entries(ttl, MAX_ENTRIES)
    }

    pub fn with_max_entries(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached decision for `secret_hash`, if still fresh.
    pub fn lookup(&self, secret_hash: &str) -> Option<bool> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(secret_hash)
            .filter(|entry| entry.checked_at.elapsed() < self.ttl)
            .map(|entry| entry.passed)
    }

    pub fn store(&self, secret_hash: &str, passed: bool) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.max_entries && !entries.contains_key(secret_hash) {
            entries.retain(|_, entry| entry.checked_at.elapsed() < self.ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.checked_at)
                    .map(|(hash, _)| hash.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            secret_hash.to_string(),
            AuthCacheEntry {
                passed,
                checked_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.checked_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The read and write caches of one backend instance.
#[derive(Debug)]
pub struct InstanceAuthCache {
    read: AuthCache,
    write: AuthCache,
}

impl InstanceAuthCache {
    pub fn new(read_ttl: Duration, write_ttl: Duration) -> Self {
        Self {
            read: AuthCache::new(read_ttl),
            write: AuthCache::new(write_ttl),
        }
    }

    pub fn for_mode(&self, mode: AuthMode) -> &AuthCache {
        match mode {
            AuthMode::Read => &self.read,
            AuthMode::Write => &self.write,
        }
    }

    pub fn clear(&self) {
        self.read.clear();
        self.write.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.read.purge_expired() + self.write.purge_expired()
    }
}
