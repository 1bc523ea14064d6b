//! Production broker adapters.
//!
//! The in-memory broker used by tests lives in `batchexec-messaging`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConnection, RedisStreamsSession};
