//! Execution context construction
//!
//! The handler-facing [`Context`] type lives in the SDK so both sides of the
//! library boundary agree on its shape. The runtime builds exactly one per
//! process at startup and keeps it for the process lifetime; only its
//! `environment`, `code_version` and `last_invocation` change afterwards.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use faas_runtime_sdk::{Context, Environment};

use crate::config::RuntimeConfig;

/// Invocation identifier for tracing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationId(String);

impl InvocationId {
    /// Create a new random invocation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builder for the process-wide execution context
pub struct ContextBuilder<'a> {
    config: &'a RuntimeConfig,
    code_version: Option<DateTime<Utc>>,
    environment: Environment,
}

impl<'a> ContextBuilder<'a> {
    /// Start from the run metadata in `config`
    pub fn new(config: &'a RuntimeConfig) -> Self {
        Self {
            config,
            code_version: None,
            environment: Environment::new(),
        }
    }

    /// Set the module modification time observed at load
    pub fn code_version(mut self, code_version: Option<DateTime<Utc>>) -> Self {
        self.code_version = code_version;
        self
    }

    /// Seed the environment
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        let mut context = Context::new(
            self.config.store.endpoint(),
            self.config.input_key.clone(),
            self.config.output_key.clone(),
        );
        context.code_version = self.code_version;
        context.environment = self.environment;
        context
    }
}
