// ABOUTME: Prometheus metrics for relay outcomes, attachments, errors and parent polling
// ABOUTME: Thin helpers over the metrics facade; the exporter handle renders /metrics

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Mutex;

static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install the Prometheus recorder once per process and return its handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    let mut slot = HANDLE
        .lock()
        .map_err(|e| anyhow::anyhow!("Metrics handle mutex poisoned: {}", e))?;
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    *slot = Some(handle.clone());
    Ok(handle)
}

/// One inbound event reached a terminal state
pub fn record_relay_event(source: &str, outcome: &str) {
    counter!(
        "slackord_relay_events_total",
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// One attachment was staged, failed, or skipped as a duplicate
pub fn record_attachment(result: &str) {
    counter!("slackord_attachments_total", "result" => result.to_string()).increment(1);
}

pub fn record_error(kind: &str) {
    counter!("slackord_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Probes spent waiting for a thread parent's identity
pub fn record_parent_poll(attempts: u32) {
    histogram!("slackord_parent_poll_attempts").record(f64::from(attempts));
}
