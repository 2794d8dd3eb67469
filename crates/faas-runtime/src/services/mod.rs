//! Key-value store clients
//!
//! The runtime talks to its store through [`KeyValueStore`]:
//! - [`RedisStore`] - Redis, the production backend
//! - [`MemoryStore`] - in-process map for tests and dry runs
//!
//! Clients move strings only; JSON encoding is the orchestrator's job.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors returned by store clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),
}

/// Common trait for key-value store clients
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key; `Ok(None)` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a key, overwriting any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Liveness check
    async fn ping(&self) -> Result<bool, StoreError>;

    /// Human-readable target, without credentials
    fn describe(&self) -> String;
}
