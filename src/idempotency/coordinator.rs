use crate::config::IdempotencySettings;
use crate::error::{IdempotencyError, Result, SharedError};
use crate::idempotency::flight::{FlightLease, FlightRegistry};
use crate::idempotency::key_codec::KeyCodec;
use crate::observability::{mask_sensitive, IdempotencyObserver, LatencyTimer, NoopObserver};
use crate::store::{validate_key, ExpiringStore, StoreExt, DEFAULT_TTL};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lifetime of stored results
    pub default_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
        }
    }
}

/// Runs an operation at most once per key and hands every caller with that key the same result.
///
/// Lookup goes to the store; on a miss, concurrent callers for one key share a single
/// in-flight execution (process-local only). The result is stored before anyone sees it;
/// failures are returned to all waiters and never stored.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn ExpiringStore>,
    key_codec: KeyCodec,
    flights: Arc<FlightRegistry>,
    observer: Arc<dyn IdempotencyObserver>,
    config: CoordinatorConfig,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn ExpiringStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            key_codec: KeyCodec::with_default_config(),
            flights: Arc::new(FlightRegistry::new()),
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    pub fn from_settings(store: Arc<dyn ExpiringStore>, settings: &IdempotencySettings) -> Self {
        let config = CoordinatorConfig {
            default_ttl: settings.default_ttl(),
        };
        Self::new(store, config).with_key_codec(KeyCodec::new(settings.key_codec_config()))
    }

    pub fn with_key_codec(mut self, key_codec: KeyCodec) -> Self {
        self.key_codec = key_codec;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn IdempotencyObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn key_codec(&self) -> &KeyCodec {
        &self.key_codec
    }

    pub fn store(&self) -> Arc<dyn ExpiringStore> {
        Arc::clone(&self.store)
    }

    /// Number of keys currently executing.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Returns the stored result for `key`, or runs `operation` once and stores its result.
    ///
    /// `cancel` only abandons this caller's wait. The operation keeps running while any
    /// other caller waits on it, and receives a token that fires once none are left.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        validate_key(key)?;

        if let Some(cached) = lookup::<T>(self.store.as_ref(), self.observer.as_ref(), key).await {
            self.observer.on_hit(key);
            tracing::debug!(key = %mask_sensitive(key, 4), "Returning stored result");
            return Ok(cached);
        }
        self.observer.on_miss(key);

        let (waiter, lease) = self.flights.join(key);
        match lease {
            Some(lease) => {
                let store = Arc::clone(&self.store);
                let observer = Arc::clone(&self.observer);
                let ttl = self.config.default_ttl;
                tokio::spawn(run_flight(lease, store, observer, ttl, operation));
            }
            None => {
                self.observer.on_joined(key);
                tracing::debug!(key = %mask_sensitive(key, 4), "Joined in-flight execution");
            }
        }

        let value = waiter.wait(cancel).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Same as [`execute`](Self::execute), passing `context` through to the operation.
    pub async fn execute_with_context<C, T, F, Fut>(
        &self,
        key: &str,
        context: C,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        C: Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(C, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.execute(key, move |token| operation(context, token), cancel)
            .await
    }
}

/// Store lookup where every failure is a miss; backend failures reach the observer.
async fn lookup<T: DeserializeOwned + Send>(
    store: &dyn ExpiringStore,
    observer: &dyn IdempotencyObserver,
    key: &str,
) -> Option<T> {
    store
        .get_reporting(key, |_| observer.on_store_error("get"))
        .await
        .ok()
        .flatten()
}

/// Body of one epoch; runs detached from any single caller.
async fn run_flight<T, F, Fut>(
    mut lease: FlightLease,
    store: Arc<dyn ExpiringStore>,
    observer: Arc<dyn IdempotencyObserver>,
    ttl: Duration,
    operation: F,
) where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let key = lease.key().to_string();
    let masked = mask_sensitive(&key, 4);

    lease.predecessor_settled().await;

    // Another epoch may have stored a result between our miss and taking the lease.
    if let Some(stored) = lookup::<T>(store.as_ref(), observer.as_ref(), &key).await {
        tracing::debug!(key = %masked, "Result stored by a concurrent epoch");
        lease.publish(serde_json::to_value(&stored).map_err(IdempotencyError::from));
        return;
    }

    let abandoned = lease.abandoned();
    let timer = LatencyTimer::new();
    let result = tokio::select! {
        biased;
        _ = abandoned.cancelled() => {
            tracing::debug!(key = %masked, "All callers cancelled, abandoning execution");
            return;
        }
        result = operation(abandoned.clone()) => result,
    };

    let value = match result {
        Ok(value) => value,
        Err(e) => {
            observer.on_operation_failed(&key);
            tracing::warn!(key = %masked, "Idempotent operation failed: {:#}", e);
            lease.publish(Err(IdempotencyError::Operation(SharedError::new(e))));
            return;
        }
    };
    observer.on_executed(&key, timer.elapsed_ms());

    let payload = match encode_result(&value) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(key = %masked, "Result cannot be stored: {}", e);
            lease.publish(Err(e));
            return;
        }
    };

    let outcome = match store.set(&key, &payload, Some(ttl)).await {
        Ok(()) => {
            tracing::debug!(key = %masked, ttl_secs = ttl.as_secs(), "Stored idempotent result");
            Ok(payload)
        }
        Err(e) => {
            observer.on_store_error("set");
            tracing::error!(key = %masked, "Failed to store idempotent result: {}", e);
            Err(IdempotencyError::ResultNotStored {
                key: key.clone(),
                payload,
                source: Box::new(e),
            })
        }
    };
    lease.publish(outcome);
}

/// Encodes a result and checks it decodes back into `T`.
///
/// JSON has no NaN or infinity; serde_json writes them as `null`, which a plain `f64` field
/// cannot read back. Such results are rejected before anything is stored.
fn encode_result<T: Serialize + DeserializeOwned>(value: &T) -> Result<serde_json::Value> {
    let payload = serde_json::to_value(value)?;
    serde_json::from_value::<T>(payload.clone()).map_err(|e| {
        IdempotencyError::Serialization(format!("Result does not survive encoding: {}", e))
    })?;
    Ok(payload)
}
