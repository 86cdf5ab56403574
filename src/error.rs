use serde::de::DeserializeOwned;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a caller-supplied operation, shared between every caller of one epoch.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Returns the operation's error exactly as it was raised.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl Deref for SharedError {
    type Target = anyhow::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Clone, Error)]
pub enum IdempotencyError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No idempotency key found for '{name}'")]
    MissingKey { name: String },

    #[error("Operation failed: {0}")]
    Operation(SharedError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Result for key '{key}' was computed but could not be stored: {source}")]
    ResultNotStored {
        key: String,
        payload: serde_json::Value,
        #[source]
        source: Box<IdempotencyError>,
    },

    #[error("Wait for idempotent result was cancelled")]
    Cancelled,

    #[error("In-flight execution ended without a result")]
    FlightAborted,
}

impl IdempotencyError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns the operation's own error when this failure came from the operation.
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Operation(e) => Some(e.inner()),
            _ => None,
        }
    }

    /// Recovers the already-computed result carried by a `ResultNotStored` failure.
    pub fn recover<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Self::ResultNotStored { payload, .. } => serde_json::from_value(payload.clone()).ok(),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for IdempotencyError {
    fn from(e: redis::RedisError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
