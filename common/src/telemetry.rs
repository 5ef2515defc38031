// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting
///
/// RUST_LOG takes precedence over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, "Structured logging initialized");

    Ok(())
}

/// Install the Prometheus exporter and describe the engine's metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "jobs_scheduled_total",
        "Scheduling decisions taken by the master, by outcome"
    );
    describe_counter!(
        "jobs_executed_total",
        "Job executions finished on this node, by result"
    );
    describe_histogram!("job_duration_seconds", "Duration of one job execution");
    describe_counter!(
        "lock_contention_total",
        "Job occurrences skipped because another holder owned the lock"
    );
    describe_counter!(
        "records_reconciled_total",
        "Execution records folded into task status"
    );

    tracing::info!(metrics_port = metrics_port, "Prometheus exporter installed");
    Ok(())
}

/// Record a validation pipeline outcome
pub fn record_schedule_outcome(outcome: &'static str) {
    counter!("jobs_scheduled_total", "outcome" => outcome).increment(1);
}

/// Record one finished execution attempt
pub fn record_job_execution(success: bool, duration_seconds: f64) {
    let result = if success { "success" } else { "failure" };
    counter!("jobs_executed_total", "result" => result).increment(1);
    histogram!("job_duration_seconds").record(duration_seconds);
}

pub fn record_lock_contention() {
    counter!("lock_contention_total").increment(1);
}

pub fn record_reconciled() {
    counter!("records_reconciled_total").increment(1);
}
