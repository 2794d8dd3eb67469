//! FaaS runtime - main entry point
//!
//! Loads configuration from the environment, resolves the handler library,
//! connects to the store and polls until interrupted. Fatal errors exit with
//! a code identifying the failed phase; ctrl-c exits 0.

use std::process::ExitCode;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faas_runtime::bundle;
use faas_runtime::config::RuntimeConfig;
use faas_runtime::error::{RuntimeError, StartupError};
use faas_runtime::runtime::{DylibLoader, Orchestrator};
use faas_runtime::services::RedisStore;

fn main() -> ExitCode {
    match bootstrap() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("faas-runtime: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn bootstrap() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,faas_runtime=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    // One logical task: fetch, invoke and persist never overlap
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let code = match runtime.block_on(run()) {
        Ok(()) => {
            tracing::info!("Runtime stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(phase = ?e.phase(), exit_code = e.exit_code(), "{}", e);
            ExitCode::from(e.exit_code())
        }
    };
    Ok(code)
}

async fn run() -> Result<(), RuntimeError> {
    tracing::info!("Starting FaaS runtime");

    let config = RuntimeConfig::from_env();
    tracing::info!("Configuration loaded: {:?}", config);
    config.validate()?;

    let module = bundle::resolve(&config)?;
    tracing::info!(module = ?module.path, "Handler module resolved");

    let store = RedisStore::connect(&config.store)
        .await
        .map_err(|e| StartupError::StoreUnreachable {
            endpoint: config.store.endpoint().to_string(),
            reason: e.to_string(),
        })?;

    let loader = DylibLoader::new(&module);
    if loader.companion_count() > 0 {
        tracing::info!(count = loader.companion_count(), "Companion libraries loaded");
    }

    let mut orchestrator = Orchestrator::start(config, store, loader, module).await?;
    orchestrator.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
