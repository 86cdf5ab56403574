//! Expiring key/value stores holding idempotent results.
//!
//! Backends only move encoded [`Payload`]s; typed access goes through [`StoreExt`], which
//! turns backend failures and undecodable entries into misses.

pub mod local;
pub mod redis;

use crate::error::{IdempotencyError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub use self::local::{CacheEntry, LocalStore, SweepJob};
pub use self::redis::RemoteStore;

/// Default entry lifetime when neither the call nor the store specifies one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Encoding of a stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
}

/// An encoded result plus the format it was encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub format: PayloadFormat,
    pub bytes: Arc<[u8]>,
}

impl Payload {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self {
            format: PayloadFormat::Json,
            bytes: bytes.into(),
        })
    }

    pub fn from_json(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            format: PayloadFormat::Json,
            bytes: bytes.into(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.format {
            PayloadFormat::Json => Ok(serde_json::from_slice(&self.bytes)?),
        }
    }
}

/// Rejects empty and whitespace-only keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(IdempotencyError::invalid_argument(
            "Idempotency key must not be empty",
        ));
    }
    Ok(())
}

/// Capability set every backend provides.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns the live payload for `key`, `None` on a miss or an expired entry.
    async fn get_payload(&self, key: &str) -> Result<Option<Payload>>;

    /// Stores `payload` under `key`, replacing any existing entry. `None` uses the store default.
    async fn set_payload(&self, key: &str, payload: Payload, ttl: Option<Duration>) -> Result<()>;
}

/// Typed access on top of [`ExpiringStore`].
#[async_trait]
pub trait StoreExt: ExpiringStore {
    /// Returns `Ok(None)` for misses, expired entries, undecodable entries and backend
    /// failures. Only an invalid key is an error.
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.get_reporting(key, |_| {}).await
    }

    /// [`get`](Self::get), handing any backend failure to `on_error` before it becomes a miss.
    async fn get_reporting<T, E>(&self, key: &str, on_error: E) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
        E: FnOnce(&IdempotencyError) + Send,
    {
        validate_key(key)?;

        let payload = match self.get_payload(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(e @ IdempotencyError::InvalidArgument(_)) => return Err(e),
            Err(e) => {
                on_error(&e);
                tracing::warn!(store = self.name(), "Store get failed, treating as miss: {}", e);
                return Ok(None);
            }
        };

        match payload.decode() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(store = self.name(), "Stored payload does not decode, treating as miss: {}", e);
                Ok(None)
            }
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        validate_key(key)?;
        let payload = Payload::encode(value)?;
        self.set_payload(key, payload, ttl).await
    }
}

impl<S: ExpiringStore + ?Sized> StoreExt for S {}
