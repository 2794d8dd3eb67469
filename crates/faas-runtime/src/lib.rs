//! FaaS runtime - a single-tenant serverless runtime driven by a key-value store
//!
//! The runtime watches one store key for input, runs a handler library
//! whenever that input changes, and writes the handler's output to another
//! key. Handlers are built against `faas-runtime-sdk`.

pub mod bundle;
pub mod config;
pub mod error;
pub mod runtime;
pub mod services;

pub use config::RuntimeConfig;
pub use error::{ErrorPhase, LoadError, RuntimeError, StartupError};
pub use runtime::{Orchestrator, TickOutcome};
pub use services::{KeyValueStore, MemoryStore, RedisStore, StoreError};
