//! Process-local registry of in-flight executions, one per key.
//!
//! The first caller for a key becomes the leader and receives a [`FlightLease`]; everyone
//! else for that key gets a [`FlightWaiter`] on the same epoch. The lease publishes the
//! single outcome and removes the entry. The map lock is only held while the map changes.
//! An epoch opened over an abandoned one waits for the abandoned one to finish first, since
//! its operation may already have completed and be storing its result.
//! Nothing here spans processes that share a remote store.

use crate::error::{IdempotencyError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Outcome = Result<serde_json::Value>;

struct Flight {
    rx: watch::Receiver<Option<Outcome>>,
    /// Cancelled once every waiter has given up.
    cancel: CancellationToken,
}

struct Slot {
    flight: Arc<Flight>,
    waiters: usize,
}

#[derive(Default)]
pub struct FlightRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl FlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        self.slots().len()
    }

    /// Attaches to the epoch in flight for `key`, or opens one.
    ///
    /// The lease is `Some` only for the caller that opened the epoch.
    pub fn join(self: &Arc<Self>, key: &str) -> (FlightWaiter, Option<FlightLease>) {
        let mut slots = self.slots();

        let mut predecessor = None;
        if let Some(slot) = slots.get_mut(key) {
            if !slot.flight.cancel.is_cancelled() {
                slot.waiters += 1;
                let waiter = FlightWaiter::new(self.clone(), key, slot.flight.clone());
                return (waiter, None);
            }
            // Abandoned but possibly still storing; the new epoch starts after it settles.
            predecessor = Some(slot.flight.rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        let flight = Arc::new(Flight {
            rx,
            cancel: CancellationToken::new(),
        });
        slots.insert(
            key.to_string(),
            Slot {
                flight: flight.clone(),
                waiters: 1,
            },
        );

        let waiter = FlightWaiter::new(self.clone(), key, flight.clone());
        let lease = FlightLease {
            registry: self.clone(),
            key: key.to_string(),
            flight,
            tx,
            predecessor,
        };
        (waiter, Some(lease))
    }

    /// Drops the slot for `key` if it still belongs to `flight`.
    fn remove(&self, key: &str, flight: &Arc<Flight>) {
        let mut slots = self.slots();
        if slots
            .get(key)
            .is_some_and(|slot| Arc::ptr_eq(&slot.flight, flight))
        {
            slots.remove(key);
        }
    }

    fn leave(&self, key: &str, flight: &Arc<Flight>) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(key) {
            if Arc::ptr_eq(&slot.flight, flight) {
                slot.waiters = slot.waiters.saturating_sub(1);
                if slot.waiters == 0 {
                    flight.cancel.cancel();
                }
            }
        }
    }
}

/// Held by the task running the operation. Dropping it without publishing ends the
/// epoch with [`IdempotencyError::FlightAborted`].
pub struct FlightLease {
    registry: Arc<FlightRegistry>,
    key: String,
    flight: Arc<Flight>,
    tx: watch::Sender<Option<Outcome>>,
    predecessor: Option<watch::Receiver<Option<Outcome>>>,
}

impl FlightLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fires when every caller waiting on this epoch has cancelled.
    pub fn abandoned(&self) -> CancellationToken {
        self.flight.cancel.clone()
    }

    /// Resolves once the abandoned epoch this one replaced has published or been dropped.
    pub async fn predecessor_settled(&mut self) {
        if let Some(mut rx) = self.predecessor.take() {
            // Err means the old lease was dropped without publishing; either way it is done.
            let _ = rx.wait_for(Option::is_some).await;
        }
    }

    /// Ends the epoch and hands `outcome` to every waiter.
    pub fn publish(self, outcome: Outcome) {
        self.registry.remove(&self.key, &self.flight);
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightLease {
    fn drop(&mut self) {
        self.registry.remove(&self.key, &self.flight);
    }
}

/// One caller's wait on an epoch.
pub struct FlightWaiter {
    registry: Arc<FlightRegistry>,
    key: String,
    flight: Arc<Flight>,
    rx: watch::Receiver<Option<Outcome>>,
}

impl FlightWaiter {
    fn new(registry: Arc<FlightRegistry>, key: &str, flight: Arc<Flight>) -> Self {
        let rx = flight.rx.clone();
        Self {
            registry,
            key: key.to_string(),
            flight,
            rx,
        }
    }

    /// Waits for the epoch's outcome. `cancel` only ends this caller's wait.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Outcome {
        tokio::select! {
            biased;
            published = self.rx.wait_for(Option::is_some) => match published {
                Ok(outcome) => outcome.clone().unwrap_or(Err(IdempotencyError::FlightAborted)),
                Err(_) => Err(IdempotencyError::FlightAborted),
            },
            _ = cancel.cancelled() => Err(IdempotencyError::Cancelled),
        }
    }
}

impl Drop for FlightWaiter {
    fn drop(&mut self) {
        self.registry.leave(&self.key, &self.flight);
    }
}
