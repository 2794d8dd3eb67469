//! Execution context passed to every handler
//!
//! The context carries immutable run metadata (store endpoint, key names,
//! code version) and the mutable `environment`. The environment is the only
//! state that survives between invocations: the runtime keeps whatever the
//! handler leaves there and hands it to the next call.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encode;
use crate::error::HandlerError;

/// Input snapshot read from the input key
pub type Snapshot = Map<String, Value>;

/// Cross-invocation environment owned by the runtime
pub type Environment = Map<String, Value>;

/// Store connection descriptor (no credentials)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
    /// Logical database index
    pub db: i64,
}

impl std::fmt::Display for StoreEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Context handed to a handler for one invocation
///
/// # Example
///
/// ```ignore
/// fn handle(input: &Snapshot, ctx: &mut Context) -> Result<JsonValue, HandlerError> {
///     let mut seen: u64 = ctx.env_or_default("seen");
///     seen += 1;
///     ctx.set_env("seen", seen)?;
///     Ok(json!({"seen": seen, "keys": input.len()}))
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Store the runtime reads input from and writes output to
    pub store: StoreEndpoint,

    /// Key polled for input snapshots
    pub input_key: String,

    /// Key the handler result is written to
    pub output_key: String,

    /// Modification time of the handler module when it was last loaded
    #[serde(default)]
    pub code_version: Option<DateTime<Utc>>,

    /// Completion time of the last persisted invocation
    #[serde(default)]
    pub last_invocation: Option<DateTime<Utc>>,

    /// Mutable state carried across invocations
    #[serde(default)]
    pub environment: Environment,
}

impl Context {
    /// Create a context with an empty environment
    pub fn new(store: StoreEndpoint, input_key: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            store,
            input_key: input_key.into(),
            output_key: output_key.into(),
            code_version: None,
            last_invocation: None,
            environment: Environment::new(),
        }
    }

    /// Read and decode an environment entry
    ///
    /// Returns `Ok(None)` when the key is absent.
    pub fn env<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HandlerError> {
        match self.environment.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::EnvironmentError(format!("{}: {}", key, e))),
        }
    }

    /// Read an environment entry, falling back to `T::default()` when it is
    /// absent or has a different shape
    pub fn env_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.env(key).ok().flatten().unwrap_or_default()
    }

    /// Encode and store an environment entry, replacing any previous value
    ///
    /// Values without a faithful JSON encoding (such as NaN) are rejected
    /// rather than stored as `null`.
    pub fn set_env<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), HandlerError> {
        let value = encode::to_value(&value)
            .map_err(|e| HandlerError::EnvironmentError(format!("{}: {}", key, e)))?;
        self.environment.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove an environment entry
    pub fn remove_env(&mut self, key: &str) -> Option<Value> {
        self.environment.remove(key)
    }
}
