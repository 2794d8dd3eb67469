//! End-to-end polling behaviour against the in-memory store and in-process handlers

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use tempfile::NamedTempFile;

use faas_runtime::bundle::{ResolvedModule, SearchPath};
use faas_runtime::config::RuntimeConfig;
use faas_runtime::error::{RuntimeError, StartupError};
use faas_runtime::runtime::orchestrator::{InvocationReason, SkipCause};
use faas_runtime::runtime::{Orchestrator, StaticLoader, TickOutcome};
use faas_runtime::services::MemoryStore;
use faas_runtime_sdk::{Context, HandlerError, Snapshot};

const INPUT: &str = "metrics";
const OUTPUT: &str = "aggregated";

type TestOrchestrator = Orchestrator<MemoryStore, Arc<StaticLoader>>;

struct Harness {
    store: MemoryStore,
    loader: Arc<StaticLoader>,
    module: NamedTempFile,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    /// Echo handler that counts its invocations
    fn echo() -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(StaticLoader::new());
        let counter = calls.clone();
        loader.register("handler", move |input: &Snapshot, _ctx: &mut Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(input.clone())
        });
        Self::with_loader(loader, calls)
    }

    fn with_loader(loader: Arc<StaticLoader>, calls: Arc<AtomicUsize>) -> Self {
        Self {
            store: MemoryStore::new(),
            loader,
            module: NamedTempFile::new().unwrap(),
            calls,
        }
    }

    fn config(&self) -> RuntimeConfig {
        RuntimeConfig::from_lookup(|key| match key {
            "REDIS_INPUT_KEY" => Some(INPUT.to_string()),
            "REDIS_OUTPUT_KEY" => Some(OUTPUT.to_string()),
            _ => None,
        })
    }

    fn module(&self) -> ResolvedModule {
        ResolvedModule {
            path: self.module.path().to_path_buf(),
            search_path: SearchPath::new(),
        }
    }

    async fn start_with(&self, config: RuntimeConfig) -> TestOrchestrator {
        Orchestrator::start(config, self.store.clone(), self.loader.clone(), self.module())
            .await
            .unwrap()
    }

    async fn start(&self) -> TestOrchestrator {
        self.start_with(self.config()).await
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn output(&self) -> Option<Value> {
        self.store
            .value(OUTPUT)
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }
}

fn invoked(reason: InvocationReason) -> TickOutcome {
    TickOutcome::Invoked { reason }
}

fn skipped(cause: SkipCause) -> TickOutcome {
    TickOutcome::Skipped { cause }
}

#[tokio::test]
async fn test_equal_inputs_invoke_once() {
    let harness = Harness::echo();
    let mut orchestrator = harness.start().await;

    harness.store.insert(INPUT, r#"{"a": 1, "b": [1, 2]}"#);
    assert_eq!(orchestrator.tick().await.unwrap(), invoked(InvocationReason::FirstRun));

    // Same structure, different text
    harness.store.insert(INPUT, r#"{ "b": [1, 2], "a": 1 }"#);
    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);
    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);

    assert_eq!(harness.calls(), 1);
    assert_eq!(harness.loader.load_count(), 1);
    assert_eq!(harness.store.write_count(), 1);
}

#[tokio::test]
async fn test_different_inputs_carry_environment_forward() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let loader = Arc::new(StaticLoader::new());
    let record = seen.clone();
    loader.register("handler", move |_input: &Snapshot, ctx: &mut Context| {
        let calls: u64 = ctx.env_or_default("calls");
        record.lock().unwrap().push(calls);
        ctx.set_env("calls", calls + 1)?;
        Ok(json!({ "calls": calls + 1 }))
    });
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));
    let mut orchestrator = harness.start().await;

    harness.store.insert(INPUT, r#"{"cpu_percent-0": 10.0}"#);
    orchestrator.tick().await.unwrap();
    let first_invocation = orchestrator.context().last_invocation;
    assert!(first_invocation.is_some());

    harness.store.insert(INPUT, r#"{"cpu_percent-0": 20.0}"#);
    assert_eq!(orchestrator.tick().await.unwrap(), invoked(InvocationReason::InputChanged));

    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    assert_eq!(orchestrator.context().environment["calls"], json!(2));
    assert_eq!(harness.output(), Some(json!({ "calls": 2 })));
    assert!(orchestrator.context().last_invocation >= first_invocation);
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = Harness::echo();
    let mut orchestrator = harness.start().await;

    let input = json!({
        "cpu_percent-0": 12.5,
        "host": "edge-01",
        "tags": ["a", "b"],
        "nested": { "ok": true, "none": null }
    });
    harness.store.insert(INPUT, input.to_string());
    orchestrator.tick().await.unwrap();

    assert_eq!(harness.output(), Some(input));
    assert_eq!(orchestrator.last_seen().cloned(), harness.output().and_then(|v| v.as_object().cloned()));
}

#[tokio::test]
async fn test_unencodable_output_is_fatal_and_not_persisted() {
    let loader = Arc::new(StaticLoader::new());
    loader.register("handler", |_input: &Snapshot, _ctx: &mut Context| {
        // Map keys must be strings in JSON
        let mut out: HashMap<(u8, u8), u8> = HashMap::new();
        out.insert((1, 2), 3);
        Ok(out)
    });
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));
    harness.store.insert(OUTPUT, r#"{"previous": true}"#);
    let mut orchestrator = harness.start().await;

    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let err = orchestrator.tick().await.unwrap_err();

    assert!(matches!(err, RuntimeError::Encoding(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(harness.output(), Some(json!({ "previous": true })));
    assert_eq!(harness.store.write_count(), 0);
    assert!(orchestrator.last_seen().is_none());
}

#[tokio::test]
async fn test_non_finite_output_is_fatal_and_not_persisted() {
    let loader = Arc::new(StaticLoader::new());
    loader.register("handler", |_input: &Snapshot, _ctx: &mut Context| {
        let mut out = BTreeMap::new();
        out.insert("avg-60sec-cpu_percent-0".to_string(), f64::NAN);
        Ok(out)
    });
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));
    harness.store.insert(OUTPUT, r#"{"previous": true}"#);
    let mut orchestrator = harness.start().await;

    harness.store.insert(INPUT, r#"{"cpu_percent-0": 10.0}"#);
    let err = orchestrator.tick().await.unwrap_err();

    assert!(matches!(err, RuntimeError::Encoding(_)));
    assert!(err.to_string().contains("NaN"));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(harness.output(), Some(json!({ "previous": true })));
    assert_eq!(harness.store.write_count(), 0);
}

#[tokio::test]
async fn test_handler_error_and_panic_are_fatal() {
    let loader = Arc::new(StaticLoader::new());
    loader.register("handler", |_input: &Snapshot, _ctx: &mut Context| -> Result<Value, HandlerError> {
        Err(HandlerError::InvalidInput("missing host".into()))
    });
    loader.register("panics", |_input: &Snapshot, _ctx: &mut Context| -> Result<Value, HandlerError> {
        panic!("handler blew up")
    });
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));

    let mut orchestrator = harness.start().await;
    let err = orchestrator.tick().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Handler(_)));
    assert!(err.to_string().contains("missing host"));
    assert_eq!(err.exit_code(), 5);

    let mut config = harness.config();
    config.handler_name = "panics".into();
    let mut orchestrator = harness.start_with(config).await;
    let err = orchestrator.tick().await.unwrap_err();
    assert!(err.to_string().contains("handler blew up"));
    assert_eq!(err.exit_code(), 5);

    assert_eq!(harness.store.write_count(), 0);
}

#[tokio::test]
async fn test_missing_handler_source_is_startup_fatal() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let module = ResolvedModule {
        path: PathBuf::from("/definitely/not/here/libusermodule.so"),
        search_path: SearchPath::new(),
    };

    let err = Orchestrator::start(harness.config(), harness.store.clone(), harness.loader.clone(), module)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, RuntimeError::Startup(StartupError::HandlerSourceMissing(_))));
    assert!(err.to_string().contains("libusermodule.so"));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(harness.store.value(OUTPUT), None);
    assert_eq!(harness.calls(), 0);
}

#[tokio::test]
async fn test_unset_output_key_is_startup_fatal() {
    let harness = Harness::echo();
    let mut config = harness.config();
    config.output_key.clear();

    let err = Orchestrator::start(config.clone(), harness.store.clone(), harness.loader.clone(), harness.module())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, RuntimeError::Startup(StartupError::OutputKeyUnset)));
    assert!(err.to_string().contains("REDIS_OUTPUT_KEY"));
    assert_eq!(harness.store.write_count(), 0);
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn test_rolling_cpu_average() {
    let loader = Arc::new(StaticLoader::new());
    loader.register("handler", metrics_aggregator::aggregate);
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));
    let mut orchestrator = harness.start().await;

    harness.store.insert(INPUT, r#"{"cpu_percent-0": 10.0}"#);
    orchestrator.tick().await.unwrap();
    assert_eq!(harness.output().unwrap()["avg-60sec-cpu_percent-0"], json!(10.0));

    harness.store.insert(INPUT, r#"{"cpu_percent-0": 20.0}"#);
    orchestrator.tick().await.unwrap();

    let output = harness.output().unwrap();
    assert_eq!(output["avg-60sec-cpu_percent-0"], json!(15.0));
    assert_eq!(
        orchestrator.context().environment[metrics_aggregator::CPU_HISTORY_KEY]["cpu_percent-0"],
        json!([10.0, 20.0])
    );
}

#[tokio::test]
async fn test_absent_input_runs_once_with_empty_snapshot() {
    let loader = Arc::new(StaticLoader::new());
    loader.register("handler", metrics_aggregator::aggregate);
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));
    let mut orchestrator = harness.start().await;

    assert_eq!(orchestrator.tick().await.unwrap(), invoked(InvocationReason::FirstRun));
    assert_eq!(orchestrator.last_seen(), Some(&Snapshot::new()));

    let output = harness.output().unwrap();
    assert_eq!(output["percent-network-egress"], json!(0.0));
    assert_eq!(output["percent-memory-cache"], json!(0.0));

    // Still absent: nothing changed
    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);
    assert_eq!(harness.loader.load_count(), 1);
}

#[tokio::test]
async fn test_store_failures_back_off_and_recover() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let mut orchestrator = harness.start().await;
    let environment_before = orchestrator.context().environment.clone();

    harness.store.fail_next(2);
    assert_eq!(orchestrator.tick().await.unwrap(), skipped(SkipCause::StoreUnavailable));
    assert_eq!(orchestrator.next_delay(), Duration::from_secs(10));
    assert_eq!(orchestrator.tick().await.unwrap(), skipped(SkipCause::StoreUnavailable));
    assert_eq!(orchestrator.next_delay(), Duration::from_secs(20));
    assert_eq!(orchestrator.store_failures(), 2);
    assert_eq!(orchestrator.context().environment, environment_before);

    assert_eq!(orchestrator.tick().await.unwrap(), invoked(InvocationReason::FirstRun));
    assert_eq!(orchestrator.store_failures(), 0);
    assert_eq!(orchestrator.next_delay(), Duration::from_secs(5));
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn test_backoff_is_capped() {
    let harness = Harness::echo();
    let mut config = harness.config();
    config.retry.max_backoff = Duration::from_secs(30);
    let mut orchestrator = harness.start_with(config).await;

    harness.store.fail_next(10);
    for _ in 0..10 {
        orchestrator.tick().await.unwrap();
    }
    assert_eq!(orchestrator.next_delay(), Duration::from_secs(30));
}

#[tokio::test]
async fn test_store_retry_budget_exhausted() {
    let harness = Harness::echo();
    let mut config = harness.config();
    config.retry.max_attempts = 2;
    let mut orchestrator = harness.start_with(config).await;

    harness.store.fail_next(5);
    assert_eq!(orchestrator.tick().await.unwrap(), skipped(SkipCause::StoreUnavailable));

    let err = orchestrator.tick().await.unwrap_err();
    assert!(matches!(err, RuntimeError::StoreExhausted { attempts: 2, .. }));
    assert_eq!(err.exit_code(), 6);
}

#[tokio::test]
async fn test_failed_write_is_flushed_without_rerunning_handler() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let mut orchestrator = harness.start().await;

    harness.store.fail_next_writes(1);
    assert_eq!(orchestrator.tick().await.unwrap(), skipped(SkipCause::StoreUnavailable));
    assert!(orchestrator.has_pending_write());
    assert!(orchestrator.last_seen().is_none());
    assert_eq!(harness.output(), None);
    assert_eq!(harness.calls(), 1);

    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);
    assert!(!orchestrator.has_pending_write());
    assert_eq!(harness.output(), Some(json!({"a": 1})));
    assert!(orchestrator.context().last_invocation.is_some());
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn test_input_changed_while_write_pending() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let mut orchestrator = harness.start().await;

    harness.store.fail_next_writes(1);
    orchestrator.tick().await.unwrap();

    harness.store.insert(INPUT, r#"{"a": 2}"#);
    assert_eq!(orchestrator.tick().await.unwrap(), invoked(InvocationReason::InputChanged));
    assert_eq!(harness.output(), Some(json!({"a": 2})));
    assert_eq!(harness.store.write_count(), 2);
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn test_code_change_reload() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);

    let mut config = harness.config();
    config.reload_on_code_change = true;
    let mut orchestrator = harness.start_with(config).await;

    orchestrator.tick().await.unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);
    let loaded_version = orchestrator.context().code_version;

    harness
        .module
        .as_file()
        .set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();

    assert_eq!(orchestrator.tick().await.unwrap(), invoked(InvocationReason::CodeChanged));
    assert_ne!(orchestrator.context().code_version, loaded_version);
    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn test_code_change_ignored_by_default() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let mut orchestrator = harness.start().await;

    orchestrator.tick().await.unwrap();
    harness
        .module
        .as_file()
        .set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();

    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Unchanged);
    assert_eq!(harness.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_polls_on_interval() {
    let harness = Harness::echo();
    harness.store.insert(INPUT, r#"{"a": 1}"#);
    let mut orchestrator = harness.start().await;

    // Ticks at 5s and 10s; shutdown at 12s
    orchestrator
        .run_until(tokio::time::sleep(Duration::from_secs(12)))
        .await
        .unwrap();

    assert_eq!(harness.calls(), 1);
    assert_eq!(harness.output(), Some(json!({"a": 1})));
}

#[tokio::test(start_paused = true)]
async fn test_run_until_stops_on_fatal_error() {
    let loader = Arc::new(StaticLoader::new());
    let harness = Harness::with_loader(loader, Arc::new(AtomicUsize::new(0)));
    let mut orchestrator = harness.start().await;

    // No "handler" entry registered
    let err = orchestrator
        .run_until(std::future::pending::<()>())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Load(_)));
}
