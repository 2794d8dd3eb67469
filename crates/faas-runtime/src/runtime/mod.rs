//! Runtime module - handler loading and the polling loop
//!
//! - Execution context construction
//! - Dynamic library handler loading, fresh on every change-triggered run
//! - The orchestrator driving fetch, compare, invoke and persist

pub mod context;
pub mod handler;
pub mod orchestrator;

pub use context::{ContextBuilder, InvocationId};
pub use handler::{DylibHandler, DylibLoader, Handler, HandlerLoader, StaticLoader};
pub use orchestrator::{InvocationReason, Orchestrator, OrchestratorState, SkipCause, TickOutcome};
