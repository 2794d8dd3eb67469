//! Serverless Runtime SDK - Types and utilities for writing runtime handlers
//!
//! This crate provides the handler contract shared by the runtime and the
//! shared libraries it loads:
//! - [`Context`]: run metadata plus the cross-invocation environment
//! - [`Snapshot`]: the JSON object read from the input key
//! - [`abi`]: the C-compatible entry point and its JSON envelopes
//! - [`export_handler!`]: exports a plain Rust function as a loadable handler

pub mod abi;
pub mod context;
pub mod encode;
pub mod error;
pub mod handler;

pub mod prelude {
    //! Common imports for handlers
    pub use crate::context::{Context, Environment, Snapshot, StoreEndpoint};
    pub use crate::error::HandlerError;
    pub use crate::export_handler;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Map, Value as JsonValue};
}

// Re-export key types at crate root
pub use context::{Context, Environment, Snapshot, StoreEndpoint};
pub use error::HandlerError;
pub use abi::{Failure, FailureKind};
