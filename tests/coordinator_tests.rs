use idempotency_engine::idempotency::{CoordinatorConfig, IdempotencyCoordinator};
use idempotency_engine::observability::IdempotencyMetrics;
use async_trait::async_trait;
use idempotency_engine::store::{ExpiringStore, LocalStore, Payload, StoreExt};
use idempotency_engine::{IdempotencyError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    total: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("payment gateway rejected the charge")]
struct GatewayRejected;

/// Local store whose writes take `delay` to land.
struct SlowSetStore {
    inner: LocalStore,
    delay: Duration,
}

#[async_trait]
impl ExpiringStore for SlowSetStore {
    fn name(&self) -> &'static str {
        "slow-set"
    }

    async fn get_payload(&self, key: &str) -> Result<Option<Payload>> {
        self.inner.get_payload(key).await
    }

    async fn set_payload(&self, key: &str, payload: Payload, ttl: Option<Duration>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_payload(key, payload, ttl).await
    }
}

/// Local store where another writer lands `value` right after the first lookup misses.
struct RacedStore {
    inner: LocalStore,
    value: Payload,
    lookups: AtomicUsize,
}

#[async_trait]
impl ExpiringStore for RacedStore {
    fn name(&self) -> &'static str {
        "raced"
    }

    async fn get_payload(&self, key: &str) -> Result<Option<Payload>> {
        if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.set_payload(key, self.value.clone(), None).await?;
            return Ok(None);
        }
        self.inner.get_payload(key).await
    }

    async fn set_payload(&self, key: &str, payload: Payload, ttl: Option<Duration>) -> Result<()> {
        self.inner.set_payload(key, payload, ttl).await
    }
}

fn setup(ttl: Duration) -> (Arc<LocalStore>, IdempotencyCoordinator) {
    let store = Arc::new(LocalStore::new(ttl));
    let coordinator = IdempotencyCoordinator::new(
        store.clone(),
        CoordinatorConfig { default_ttl: ttl },
    );
    (store, coordinator)
}

#[tokio::test]
async fn test_concurrent_callers_share_one_execution() {
    let (_store, coordinator) = setup(Duration::from_secs(60));
    let runs = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let coordinator = coordinator.clone();
        let runs = runs.clone();
        let release = release.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .execute(
                    "order-42",
                    move |_| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(Order { id: 1, total: 9.99 })
                    },
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    // Let every caller reach the flight before the operation finishes.
    while coordinator.in_flight() == 0 || runs.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_waiters();

    for handle in handles {
        let order: Order = handle.await.unwrap().unwrap();
        assert_eq!(order, Order { id: 1, total: 9.99 });
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_hit_bypasses_operation() {
    let (_store, coordinator) = setup(Duration::from_secs(60));
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let runs = runs.clone();
        let total: u32 = coordinator
            .execute(
                "pay-1",
                move |_| async move {
                    let n = runs.fetch_add(1, Ordering::SeqCst) as u32;
                    Ok(100 + n)
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(total, 100);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_propagates_and_is_not_cached() {
    let (store, coordinator) = setup(Duration::from_secs(60));

    let err = coordinator
        .execute::<Order, _, _>(
            "pay-1",
            |_| async { Err(anyhow::Error::new(GatewayRejected)) },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    let original = err.operation_error().expect("operation error");
    assert!(original.downcast_ref::<GatewayRejected>().is_some());

    let cached: Option<Order> = store.get("pay-1").await.unwrap();
    assert!(cached.is_none());

    // A retry runs the operation again.
    let order: Order = coordinator
        .execute(
            "pay-1",
            |_| async { Ok(Order { id: 2, total: 1.0 }) },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(order.id, 2);
}

#[tokio::test]
async fn test_every_waiter_receives_the_failure() {
    let (_store, coordinator) = setup(Duration::from_secs(60));
    let runs = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let coordinator = coordinator.clone();
        let runs = runs.clone();
        let release = release.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .execute::<Order, _, _>(
                    "pay-2",
                    move |_| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Err(anyhow::anyhow!("declined"))
                    },
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    while runs.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_waiters();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, IdempotencyError::Operation(_)));
        assert_eq!(err.to_string(), "Operation failed: declined");
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_caller_does_not_abort_shared_work() {
    let (store, coordinator) = setup(Duration::from_secs(60));
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());

    let leader_cancel = CancellationToken::new();
    let leader = {
        let coordinator = coordinator.clone();
        let release = release.clone();
        let started = started.clone();
        let cancel = leader_cancel.clone();
        tokio::spawn(async move {
            coordinator
                .execute(
                    "pay-3",
                    move |_| async move {
                        started.notify_one();
                        release.notified().await;
                        Ok(7u32)
                    },
                    &cancel,
                )
                .await
        })
    };
    started.notified().await;

    let follower = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute(
                    "pay-3",
                    |_| async { Ok(0u32) },
                    &CancellationToken::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    leader_cancel.cancel();
    let leader_result = leader.await.unwrap();
    assert!(matches!(leader_result, Err(IdempotencyError::Cancelled)));

    release.notify_waiters();
    assert_eq!(follower.await.unwrap().unwrap(), 7);
    assert_eq!(store.get::<u32>("pay-3").await.unwrap(), Some(7));
}

#[tokio::test]
async fn test_operation_stops_when_every_caller_cancels() {
    let (store, coordinator) = setup(Duration::from_secs(60));
    let started = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let caller = {
        let coordinator = coordinator.clone();
        let started = started.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .execute(
                    "pay-4",
                    move |epoch: CancellationToken| async move {
                        started.notify_one();
                        epoch.cancelled().await;
                        Ok(1u32)
                    },
                    &cancel,
                )
                .await
        })
    };
    started.notified().await;

    cancel.cancel();
    assert!(matches!(caller.await.unwrap(), Err(IdempotencyError::Cancelled)));

    for _ in 0..100 {
        if coordinator.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(coordinator.in_flight(), 0);
    assert!(store.get::<u32>("pay-4").await.unwrap().is_none());
}

#[tokio::test]
async fn test_execute_with_context_threads_context() {
    let (_store, coordinator) = setup(Duration::from_secs(60));

    let order: Order = coordinator
        .execute_with_context(
            "ctx-1",
            (5u32, 2.5f64),
            |(id, total), _| async move { Ok(Order { id, total }) },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(order, Order { id: 5, total: 2.5 });
}

#[tokio::test]
async fn test_blank_key_is_invalid() {
    let (_store, coordinator) = setup(Duration::from_secs(60));

    let result = coordinator
        .execute::<u32, _, _>("   ", |_| async { Ok(1) }, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(IdempotencyError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_expired_result_starts_new_epoch() {
    let (_store, coordinator) = setup(Duration::from_millis(100));
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let runs = runs.clone();
        let _: u32 = coordinator
            .execute(
                "pay-5",
                move |_| async move { Ok(runs.fetch_add(1, Ordering::SeqCst) as u32) },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_observer_counts_hits_and_joins() {
    let store = Arc::new(LocalStore::new(Duration::from_secs(60)));
    let metrics = Arc::new(IdempotencyMetrics::new());
    let coordinator = IdempotencyCoordinator::new(store, CoordinatorConfig::default())
        .with_observer(metrics.clone());

    for _ in 0..3 {
        let _: u32 = coordinator
            .execute("pay-6", |_| async { Ok(1) }, &CancellationToken::new())
            .await
            .unwrap();
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.misses, 1);
    assert_eq!(snapshot.hits, 2);
    assert_eq!(snapshot.executions, 1);
    assert_eq!(snapshot.failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_callers_share_one_execution() {
    let (store, coordinator) = setup(Duration::from_secs(60));
    let runs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(32));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let coordinator = coordinator.clone();
        let runs = runs.clone();
        let start = start.clone();
        handles.push(tokio::spawn(async move {
            start.wait().await;
            coordinator
                .execute(
                    "order-77",
                    move |_| async move {
                        let id = runs.fetch_add(1, Ordering::SeqCst) as u32;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Order { id, total: 1.0 })
                    },
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    for handle in handles {
        let order: Order = handle.await.unwrap().unwrap();
        assert_eq!(order.id, 0);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let stored: Option<Order> = store.get("order-77").await.unwrap();
    assert_eq!(stored.map(|o| o.id), Some(0));
}

#[tokio::test]
async fn test_result_stored_after_miss_is_reused() {
    let store = Arc::new(RacedStore {
        inner: LocalStore::new(Duration::from_secs(60)),
        value: Payload::encode(&Order { id: 5, total: 2.0 }).unwrap(),
        lookups: AtomicUsize::new(0),
    });
    let coordinator = IdempotencyCoordinator::new(store.clone(), CoordinatorConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();

    let order: Order = coordinator
        .execute(
            "order-5",
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Order { id: 6, total: 3.0 })
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(order, Order { id: 5, total: 2.0 });
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_epoch_still_storing_is_not_rerun() {
    let store = Arc::new(SlowSetStore {
        inner: LocalStore::new(Duration::from_secs(60)),
        delay: Duration::from_millis(300),
    });
    let coordinator = IdempotencyCoordinator::new(store, CoordinatorConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));

    let first_cancel = CancellationToken::new();
    let first = {
        let coordinator = coordinator.clone();
        let runs = runs.clone();
        let cancel = first_cancel.clone();
        tokio::spawn(async move {
            coordinator
                .execute::<u32, _, _>(
                    "pay-9",
                    move |_| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    },
                    &cancel,
                )
                .await
        })
    };

    // The operation has returned and its result is on the way to the store.
    tokio::time::sleep(Duration::from_millis(50)).await;
    first_cancel.cancel();
    assert!(matches!(
        first.await.unwrap(),
        Err(IdempotencyError::Cancelled)
    ));

    let counter = runs.clone();
    let second: u32 = coordinator
        .execute(
            "pay-9",
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(second, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
