pub mod coordinator;
pub mod flight;
pub mod key_codec;

pub use coordinator::{CoordinatorConfig, IdempotencyCoordinator};
pub use flight::{FlightLease, FlightRegistry, FlightWaiter};
pub use key_codec::{KeyCodec, KeyCodecConfig, KeySource, ReadSeek};
