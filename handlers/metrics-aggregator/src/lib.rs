//! Metrics aggregator handler
//!
//! Consumes host metric snapshots (`cpu_percent-N`, `net_io_counters_eth0-*`,
//! `virtual_memory-*`) and produces:
//! - `avg-60sec-cpu_percent-N`: mean of the last 60 seconds of samples per CPU
//! - `percent-network-egress`: bytes sent over bytes sent + received
//! - `percent-memory-cache`: buffers + cached over total memory
//! - `cpu_history`: the rolling windows themselves
//!
//! The rolling windows live in the context environment under `cpu_history`.

use faas_runtime_sdk::prelude::*;

pub mod metrics;

use metrics::CpuHistory;

/// Environment key holding the rolling CPU windows
pub const CPU_HISTORY_KEY: &str = "cpu_history";

/// Aggregate one metrics snapshot
pub fn aggregate(input: &Snapshot, ctx: &mut Context) -> Result<JsonValue, HandlerError> {
    // A history that no longer decodes is an error, not a fresh start
    let mut history: CpuHistory = ctx.env(CPU_HISTORY_KEY)?.unwrap_or_default();
    metrics::update_cpu_history(input, &mut history)?;
    ctx.set_env(CPU_HISTORY_KEY, &history)?;

    let mut output = Map::new();
    output.insert(CPU_HISTORY_KEY.to_string(), json!(history));
    for (key, avg) in metrics::cpu_averages(&history) {
        output.insert(key, json!(avg));
    }
    output.insert(
        "percent-network-egress".to_string(),
        json!(metrics::network_egress_percent(input)?),
    );
    output.insert(
        "percent-memory-cache".to_string(),
        json!(metrics::memory_cache_percent(input)?),
    );

    Ok(JsonValue::Object(output))
}

export_handler!(aggregate as handler);
