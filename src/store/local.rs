use super::{validate_key, ExpiringStore, Payload, DEFAULT_TTL};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A stored result. Replaced wholesale by a later set, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    /// `None` when the TTL is too large to represent; such entries never expire.
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    pub fn new(payload: Payload, ttl: Duration) -> Self {
        Self {
            payload,
            created_at: Utc::now(),
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// In-process store. Expiry is checked lazily on read; [`SweepJob`] bounds memory.
#[derive(Debug)]
pub struct LocalStore {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl LocalStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Number of entries held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy of the live entry for `key`.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key).map(|e| e.value().clone())?;

        if entry.is_expired_at(now) {
            // A concurrent set may have replaced the entry in between; only drop the stale one.
            self.entries.remove_if(key, |_, e| e.is_expired_at(now));
            return None;
        }

        Some(entry)
    }

    /// Evicts every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl ExpiringStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get_payload(&self, key: &str) -> Result<Option<Payload>> {
        validate_key(key)?;
        Ok(self.entry(key).map(|e| e.payload))
    }

    async fn set_payload(&self, key: &str, payload: Payload, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let entry = CacheEntry::new(payload, ttl.unwrap_or(self.default_ttl));
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }
}

/// Periodic eviction of expired entries from a [`LocalStore`].
pub struct SweepJob {
    store: Arc<LocalStore>,
    interval: Duration,
}

impl SweepJob {
    pub fn new(store: Arc<LocalStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Runs the sweep once.
    pub fn run_once(&self) -> usize {
        self.store.purge_expired()
    }

    /// Starts the sweep in a background task that stops when `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(interval_secs = self.interval.as_secs(), "Local store sweep started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Local store sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let count = self.run_once();
                        if count > 0 {
                            tracing::debug!(removed = count, remaining = self.store.len(), "Swept expired entries");
                        }
                    }
                }
            }
        })
    }
}
