//! Optional key-value cache
//!
//! Repositories can use a [`Cache`] as a read-through side channel for
//! primary-key lookups. The cache is never authoritative: failures are
//! logged and the query goes to the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{OrmError, OrmResult};

/// TTL key-value store
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> OrmResult<Option<Vec<u8>>>;

    /// Store `value`; `None` keeps it until deleted or flushed
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> OrmResult<()>;

    /// Remove `key`, reporting whether it was present
    async fn delete(&self, key: &str) -> OrmResult<bool>;

    async fn flush(&self) -> OrmResult<()>;
}

/// JSON helpers over any [`Cache`]
#[async_trait]
pub trait CacheExt: Cache {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> OrmResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| OrmError::Cache(format!("corrupt entry '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> OrmResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| OrmError::Cache(format!("cannot encode '{}': {}", key, e)))?;
        self.set(key, bytes, ttl).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |exp| Instant::now() >= exp)
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// In-process cache with lazy expiry and an optional entry cap
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    eviction: Mutex<()>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict the oldest entries once `max_entries` is reached
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn make_room(&self) {
        let Some(max) = self.max_entries else {
            return;
        };
        let _guard = self.eviction.lock();
        self.entries.retain(|_, entry| !entry.is_expired());
        while self.entries.len() >= max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().created_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> OrmResult<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.data.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> OrmResult<()> {
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data: value,
                created_at: now,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> OrmResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn flush(&self) -> OrmResult<()> {
        self.entries.clear();
        Ok(())
    }
}
