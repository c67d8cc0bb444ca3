//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the fan-out / fan-in pipeline
//! with standardized naming conventions.

use crate::errors::{AppError, Result};
use crate::models::Channel;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

/// Metrics prefix for all InfluenceMapper metrics
pub const METRICS_PREFIX: &str = "influencemapper";

/// Buckets for inference latency (model calls are slow)
pub const INFERENCE_BUCKETS: &[f64] = &[
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 1m
    120.0,  // 2m
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Emitter metrics
    describe_counter!(
        format!("{}_jobs_emitted_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs published, labelled by channel and status"
    );

    // Worker metrics
    describe_counter!(
        format!("{}_worker_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs handled by workers, labelled by channel and outcome"
    );

    describe_histogram!(
        format!("{}_inference_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Inference call latency in seconds"
    );

    // Collector metrics
    describe_counter!(
        format!("{}_replies_total", METRICS_PREFIX),
        Unit::Count,
        "Replies seen by the collector side, labelled by disposition"
    );

    describe_counter!(
        format!("{}_sessions_total", METRICS_PREFIX),
        Unit::Count,
        "Sessions that reached a terminal state, labelled by outcome"
    );

    describe_histogram!(
        format!("{}_session_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Time from collector start to terminal state"
    );

    tracing::info!("Metrics registered");
}

/// Buckets for session collection time
pub const SESSION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

/// Install the Prometheus exporter on `port`. Port 0 disables it.
pub fn install_exporter(host: &str, port: u16) -> Result<()> {
    if port == 0 {
        tracing::info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| AppError::Configuration {
            message: format!("Invalid metrics address: {}", e),
        })?;

    let exporter_error = |e: metrics_exporter_prometheus::BuildError| AppError::Configuration {
        message: format!("Failed to install metrics exporter: {}", e),
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_inference_duration_seconds", METRICS_PREFIX)),
            INFERENCE_BUCKETS,
        )
        .map_err(exporter_error)?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_session_duration_seconds", METRICS_PREFIX)),
            SESSION_BUCKETS,
        )
        .map_err(exporter_error)?
        .install()
        .map_err(exporter_error)?;

    tracing::info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Record one publish attempt from the emitter
pub fn record_job_emitted(channel: Channel, success: bool) {
    let status = if success { "published" } else { "failed" };

    counter!(
        format!("{}_jobs_emitted_total", METRICS_PREFIX),
        "channel" => channel.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record how a worker disposed of one job
pub fn record_worker_outcome(channel: Channel, outcome: &'static str, duration_secs: f64) {
    counter!(
        format!("{}_worker_jobs_total", METRICS_PREFIX),
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        format!("{}_inference_duration_seconds", METRICS_PREFIX),
        "channel" => channel.to_string()
    )
    .record(duration_secs);
}

/// Record a reply disposition: accepted, malformed, duplicate, orphaned
pub fn record_reply(disposition: &'static str) {
    counter!(
        format!("{}_replies_total", METRICS_PREFIX),
        "disposition" => disposition
    )
    .increment(1);
}

/// Record a session reaching a terminal state
pub fn record_session(outcome: &'static str, duration_secs: f64) {
    counter!(
        format!("{}_sessions_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        format!("{}_session_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome
    )
    .record(duration_secs);
}
