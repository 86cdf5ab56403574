use super::{validate_key, ExpiringStore, Payload, PayloadFormat, DEFAULT_TTL};
use crate::error::{IdempotencyError, Result};
use crate::observability::LatencyTimer;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "idempotency";

/// Redis-backed store. Expiry is Redis' own (`SET .. PX`); values are JSON text.
///
/// Holds a single multiplexed connection shared by all callers; dropping the store
/// releases it.
#[derive(Clone)]
pub struct RemoteStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    default_ttl: Duration,
}

impl RemoteStore {
    /// Opens the shared connection.
    pub async fn connect(client: &redis::Client) -> Result<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    fn make_key(&self, idempotency_key: &str) -> String {
        namespaced_key(&self.key_prefix, idempotency_key)
    }

    /// Round-trips a PING; returns the latency in milliseconds.
    pub async fn ping(&self) -> Result<f64> {
        let timer = LatencyTimer::new();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(timer.elapsed_ms())
    }
}

/// `{prefix}:{key}`
pub fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Milliseconds for `PX`; Redis rejects zero, so sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl ExpiringStore for RemoteStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_payload(&self, key: &str) -> Result<Option<Payload>> {
        validate_key(key)?;

        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.make_key(key)).await?;

        Ok(value.map(|json| Payload::from_json(json.into_bytes())))
    }

    async fn set_payload(&self, key: &str, payload: Payload, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;

        let json = match payload.format {
            PayloadFormat::Json => std::str::from_utf8(&payload.bytes)
                .map_err(|e| IdempotencyError::Serialization(e.to_string()))?
                .to_string(),
        };
        let ttl = ttl.unwrap_or(self.default_ttl);

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.make_key(key))
            .arg(json)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        tracing::debug!(store = "redis", ttl_ms = ttl_millis(ttl), "Stored idempotent result");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(namespaced_key(DEFAULT_KEY_PREFIX, "order-42"), "idempotency:order-42");
        assert_eq!(namespaced_key("test", "a:b"), "test:a:b");
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_millis(500)), 500);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(86400)), 86_400_000);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}
