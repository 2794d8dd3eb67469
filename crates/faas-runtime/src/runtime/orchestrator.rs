//! Polling orchestrator
//!
//! Owns the control loop: fetch the input snapshot, skip it when it is
//! structurally equal to the last one processed, otherwise load the handler
//! fresh, invoke it, and persist its output. The environment and the
//! last-seen snapshot live here for the process lifetime.
//!
//! ```text
//! Starting -> Idle -> Fetching -> Idle                                  (unchanged)
//!                              -> Loading -> Invoking -> Persisting -> Idle
//! ```

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::Instrument;

use faas_runtime_sdk::{Context, Snapshot};

use super::context::{ContextBuilder, InvocationId};
use super::handler::HandlerLoader;
use crate::bundle::{module_mtime, ResolvedModule};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, StartupError};
use crate::services::{KeyValueStore, StoreError};

/// Where the orchestrator is in its cycle
///
/// Startup happens in [`Orchestrator::start`], before an orchestrator exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Fetching,
    Loading,
    Invoking,
    Persisting,
}

/// Why a tick ran the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationReason {
    /// Nothing has been processed yet
    FirstRun,
    /// The snapshot differs from the last one processed
    InputChanged,
    /// The handler library changed on disk (reload on code change only)
    CodeChanged,
}

impl fmt::Display for InvocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationReason::FirstRun => write!(f, "first_run"),
            InvocationReason::InputChanged => write!(f, "input_changed"),
            InvocationReason::CodeChanged => write!(f, "code_changed"),
        }
    }
}

/// Why a tick did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    /// A store call failed; retried after backoff
    StoreUnavailable,
    /// The input key does not hold a JSON object (or is not text at all)
    MalformedInput,
}

/// Result of one polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    Invoked { reason: InvocationReason },
    Skipped { cause: SkipCause },
}

// Output computed by the handler but not yet accepted by the store
struct PendingWrite {
    encoded: String,
    snapshot: Snapshot,
    invoked_at: DateTime<Utc>,
}

/// The polling control loop
pub struct Orchestrator<S, L> {
    config: RuntimeConfig,
    store: S,
    loader: L,
    module: ResolvedModule,
    context: Context,
    last_seen: Option<Snapshot>,
    pending: Option<PendingWrite>,
    store_failures: u32,
    state: OrchestratorState,
}

impl<S, L> Orchestrator<S, L>
where
    S: KeyValueStore,
    L: HandlerLoader,
{
    /// Run the startup checks and build the orchestrator
    ///
    /// Checks, in order: the handler library exists, the store answers a
    /// liveness check, an output key is configured. Nothing is read from or
    /// written to the store's keys before all three pass.
    pub async fn start(
        config: RuntimeConfig,
        store: S,
        loader: L,
        module: ResolvedModule,
    ) -> Result<Self, RuntimeError> {
        if !module.path.is_file() {
            return Err(StartupError::HandlerSourceMissing(module.path.clone()).into());
        }

        let unreachable = |reason: String| StartupError::StoreUnreachable {
            endpoint: store.describe(),
            reason,
        };
        match store.ping().await {
            Ok(true) => {}
            Ok(false) => return Err(unreachable("liveness check failed".to_string()).into()),
            Err(e) => return Err(unreachable(e.to_string()).into()),
        }

        if config.output_key.is_empty() {
            return Err(StartupError::OutputKeyUnset.into());
        }

        let context = ContextBuilder::new(&config)
            .code_version(module_mtime(&module.path))
            .build();

        tracing::info!(
            module = ?module.path,
            store = %store.describe(),
            input_key = %config.input_key,
            output_key = %config.output_key,
            "Runtime started"
        );

        Ok(Self {
            config,
            store,
            loader,
            module,
            context,
            last_seen: None,
            pending: None,
            store_failures: 0,
            state: OrchestratorState::Idle,
        })
    }

    /// Poll until `shutdown` resolves or a fatal error occurs
    ///
    /// Each cycle sleeps first, then ticks. Shutdown is only observed while
    /// sleeping, so a cycle in progress always completes.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tracing::info!(interval = ?self.config.poll_interval, "Polling started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.next_delay()) => {}
            }

            self.tick().await?;
        }
    }

    /// Run one polling cycle
    pub async fn tick(&mut self) -> Result<TickOutcome, RuntimeError> {
        let invocation = InvocationId::new();
        let span = tracing::debug_span!("tick", invocation = %invocation);
        self.cycle().instrument(span).await
    }

    /// Delay before the next cycle; grows while the store is failing
    pub fn next_delay(&self) -> Duration {
        self.config.retry.delay(self.config.poll_interval, self.store_failures)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Snapshot most recently processed and persisted
    pub fn last_seen(&self) -> Option<&Snapshot> {
        self.last_seen.as_ref()
    }

    /// Whether handler output is waiting for the store to come back
    pub fn has_pending_write(&self) -> bool {
        self.pending.is_some()
    }

    /// Consecutive store failures so far
    pub fn store_failures(&self) -> u32 {
        self.store_failures
    }

    async fn cycle(&mut self) -> Result<TickOutcome, RuntimeError> {
        if let Some(pending) = self.pending.take() {
            self.state = OrchestratorState::Persisting;
            match self.store.set(&self.config.output_key, &pending.encoded).await {
                Ok(()) => {
                    tracing::info!(key = %self.config.output_key, "Persisted pending output");
                    self.complete(pending.snapshot, pending.invoked_at);
                }
                Err(e) => {
                    self.pending = Some(pending);
                    return self.store_failure(e);
                }
            }
        }

        self.state = OrchestratorState::Fetching;
        let raw = match self.store.get(&self.config.input_key).await {
            Ok(raw) => raw,
            // The store answered; the key holds something other than text
            Err(StoreError::Command(reason)) => {
                self.store_failures = 0;
                return Ok(self.malformed_input(&reason));
            }
            Err(e) => return self.store_failure(e),
        };
        self.store_failures = 0;

        let snapshot = match decode_snapshot(raw.as_deref()) {
            Ok(snapshot) => snapshot,
            Err(reason) => return Ok(self.malformed_input(&reason)),
        };

        let Some(reason) = self.change_reason(&snapshot) else {
            tracing::debug!(key = %self.config.input_key, "Input unchanged");
            self.state = OrchestratorState::Idle;
            return Ok(TickOutcome::Unchanged);
        };

        self.state = OrchestratorState::Loading;
        let code_version = module_mtime(&self.module.path);
        let handler = self.loader.load(&self.module.path, &self.config.handler_name)?;
        self.context.code_version = code_version;

        self.state = OrchestratorState::Invoking;
        let started = Instant::now();
        let output = handler.invoke(&snapshot, &mut self.context)?;
        let invoked_at = Utc::now();
        tracing::info!(
            handler = handler.name(),
            %reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Handler invoked"
        );
        drop(handler);

        let encoded = encode_output(&output)?;

        self.state = OrchestratorState::Persisting;
        if let Err(e) = self.store.set(&self.config.output_key, &encoded).await {
            self.pending = Some(PendingWrite {
                encoded,
                snapshot,
                invoked_at,
            });
            return self.store_failure(e);
        }

        tracing::debug!(key = %self.config.output_key, bytes = encoded.len(), "Persisted output");
        self.complete(snapshot, invoked_at);

        Ok(TickOutcome::Invoked { reason })
    }

    fn change_reason(&self, snapshot: &Snapshot) -> Option<InvocationReason> {
        match &self.last_seen {
            None => Some(InvocationReason::FirstRun),
            Some(previous) if previous != snapshot => Some(InvocationReason::InputChanged),
            Some(_) if self.config.reload_on_code_change && self.code_changed() => {
                Some(InvocationReason::CodeChanged)
            }
            Some(_) => None,
        }
    }

    fn code_changed(&self) -> bool {
        match module_mtime(&self.module.path) {
            Some(current) => self.context.code_version != Some(current),
            None => false,
        }
    }

    fn malformed_input(&mut self, reason: &str) -> TickOutcome {
        tracing::warn!(key = %self.config.input_key, %reason, "Ignoring malformed input");
        self.state = OrchestratorState::Idle;
        TickOutcome::Skipped {
            cause: SkipCause::MalformedInput,
        }
    }

    fn complete(&mut self, snapshot: Snapshot, invoked_at: DateTime<Utc>) {
        self.context.last_invocation = Some(invoked_at);
        self.last_seen = Some(snapshot);
        self.state = OrchestratorState::Idle;
    }

    fn store_failure(&mut self, err: StoreError) -> Result<TickOutcome, RuntimeError> {
        self.store_failures = self.store_failures.saturating_add(1);
        self.state = OrchestratorState::Idle;

        if self.config.retry.exhausted(self.store_failures) {
            tracing::error!(failures = self.store_failures, error = %err, "Store retry budget exhausted");
            return Err(RuntimeError::StoreExhausted {
                attempts: self.store_failures,
                source: err,
            });
        }

        tracing::warn!(
            failures = self.store_failures,
            retry_in = ?self.next_delay(),
            error = %err,
            "Store unavailable, will retry"
        );
        Ok(TickOutcome::Skipped {
            cause: SkipCause::StoreUnavailable,
        })
    }
}

/// Decode the raw input value; an absent key is an empty snapshot
pub fn decode_snapshot(raw: Option<&str>) -> Result<Snapshot, String> {
    let Some(text) = raw else {
        return Ok(Snapshot::new());
    };

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, found {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn encode_output(output: &Value) -> Result<String, RuntimeError> {
    serde_json::to_string(output).map_err(|e| RuntimeError::Encoding(e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
