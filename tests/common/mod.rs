use idempotency_engine::store::RemoteStore;
use std::time::Duration;
use uuid::Uuid;

/// Connects to the Redis named by `REDIS_URL`, under a prefix unique to the calling test.
pub async fn setup_remote_store() -> RemoteStore {
    dotenvy::dotenv().ok();

    let redis_url = std::env::var("REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let client = redis::Client::open(redis_url).expect("Invalid Redis URL");
    RemoteStore::connect(&client)
        .await
        .expect("Failed to connect to test Redis")
        .with_key_prefix(format!("idempotency-test-{}", Uuid::new_v4()))
        .with_default_ttl(Duration::from_secs(60))
}
