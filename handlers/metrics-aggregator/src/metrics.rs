//! Metric calculations over a single snapshot and the rolling CPU windows

use std::collections::BTreeMap;

use faas_runtime_sdk::prelude::*;

/// Window covered by the CPU averages
pub const WINDOW_SECONDS: usize = 60;

/// Expected spacing between snapshots
pub const MEASUREMENT_PERIOD: usize = 5;

/// Samples kept per CPU key
pub const MAX_POINTS: usize = WINDOW_SECONDS / MEASUREMENT_PERIOD;

const CPU_PREFIX: &str = "cpu_percent-";

/// Rolling samples keyed by `cpu_percent-N`
pub type CpuHistory = BTreeMap<String, Vec<f64>>;

/// Append the snapshot's CPU samples, keeping at most `MAX_POINTS` per key
pub fn update_cpu_history(input: &Snapshot, history: &mut CpuHistory) -> Result<(), HandlerError> {
    for (key, value) in input.iter().filter(|(key, _)| key.starts_with(CPU_PREFIX)) {
        let sample = as_number(key, value)?;
        let window = history.entry(key.clone()).or_default();
        window.push(sample);
        if window.len() > MAX_POINTS {
            let excess = window.len() - MAX_POINTS;
            window.drain(..excess);
        }
    }
    Ok(())
}

/// Mean of each window, keyed `avg-60sec-<cpu key>`
pub fn cpu_averages(history: &CpuHistory) -> BTreeMap<String, f64> {
    history
        .iter()
        .map(|(key, window)| {
            let avg = if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<f64>() / window.len() as f64
            };
            (format!("avg-{}sec-{}", WINDOW_SECONDS, key), avg)
        })
        .collect()
}

/// Share of eth0 traffic that was sent, in percent
pub fn network_egress_percent(input: &Snapshot) -> Result<f64, HandlerError> {
    let sent = field(input, "net_io_counters_eth0-bytes_sent", 0.0)?;
    let recv = field(input, "net_io_counters_eth0-bytes_recv", 0.0)?;
    let total = sent + recv;
    if total > 0.0 {
        Ok(sent / total * 100.0)
    } else {
        Ok(0.0)
    }
}

/// Share of memory used by buffers and page cache, in percent
pub fn memory_cache_percent(input: &Snapshot) -> Result<f64, HandlerError> {
    let total = field(input, "virtual_memory-total", 1.0)?;
    let buffers = field(input, "virtual_memory-buffers", 0.0)?;
    let cached = field(input, "virtual_memory-cached", 0.0)?;
    if total <= 0.0 {
        return Ok(0.0);
    }
    Ok((buffers + cached) / total * 100.0)
}

fn field(input: &Snapshot, key: &str, default: f64) -> Result<f64, HandlerError> {
    match input.get(key) {
        None => Ok(default),
        Some(value) => as_number(key, value),
    }
}

// Collectors publish numbers either as JSON numbers or as numeric strings
fn as_number(key: &str, value: &JsonValue) -> Result<f64, HandlerError> {
    let number = match value {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| HandlerError::invalid_field(key, "number out of range")),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| HandlerError::invalid_field(key, e)),
        other => Err(HandlerError::invalid_field(key, format!("expected a number, got {}", other))),
    }?;

    // "NaN" and "inf" parse as f64 but have no JSON form
    if number.is_finite() {
        Ok(number)
    } else {
        Err(HandlerError::invalid_field(key, "not a finite number"))
    }
}
