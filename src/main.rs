use idempotency_engine::config::{Settings, StoreBackend};
use idempotency_engine::observability::{
    init_logging, init_metrics, LogConfig, PrometheusObserver,
};
use idempotency_engine::store::{ExpiringStore, LocalStore, RemoteStore, SweepJob};
use idempotency_engine::IdempotencyCoordinator;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&LogConfig::from_settings(&settings.logging))?;
    init_metrics()?;
    info!("Configuration loaded");

    let shutdown = CancellationToken::new();
    let ttl = settings.idempotency.default_ttl();

    let store: Arc<dyn ExpiringStore> = match settings.store.backend {
        StoreBackend::Local => {
            let store = Arc::new(LocalStore::new(ttl));
            if settings.store.sweep_interval_secs > 0 {
                let interval = Duration::from_secs(settings.store.sweep_interval_secs);
                SweepJob::new(store.clone(), interval).start(shutdown.clone());
            }
            info!("Using local store");
            store
        }
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}...", settings.redis.url);
            let client = redis::Client::open(settings.redis.url.as_str())?;
            let store = RemoteStore::connect(&client)
                .await?
                .with_key_prefix(settings.redis.key_prefix.clone())
                .with_default_ttl(ttl);
            let latency_ms = store.ping().await?;
            info!(latency_ms, "Redis connection established");
            Arc::new(store)
        }
    };

    let coordinator = IdempotencyCoordinator::from_settings(store, &settings.idempotency)
        .with_observer(Arc::new(PrometheusObserver));

    // Run one keyed operation twice; the second call must come from the store.
    let key = coordinator
        .key_codec()
        .derive_key(&json!({ "self_check": Uuid::new_v4() }))?;
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let runs = runs.clone();
        let value: u64 = coordinator
            .execute(
                &key,
                move |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                },
                &shutdown,
            )
            .await?;
        info!(value, "Self-check execution returned");
    }

    let executions = runs.load(Ordering::SeqCst);
    shutdown.cancel();

    if executions != 1 {
        return Err(format!("self-check ran the operation {} times", executions).into());
    }

    info!("Self-check complete: duplicate call was served from the store.");

    Ok(())
}
