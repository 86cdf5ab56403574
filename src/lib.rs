pub mod config;
pub mod error;
pub mod idempotency;
pub mod observability;
pub mod store;

pub use error::{IdempotencyError, Result};
pub use idempotency::{IdempotencyCoordinator, KeyCodec};
pub use store::{ExpiringStore, LocalStore, RemoteStore, StoreExt};
