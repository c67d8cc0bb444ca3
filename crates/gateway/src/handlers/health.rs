//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::future::Future;
use std::time::Instant;

use crate::AppState;
use influencemapper_common::errors::Result;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub transport: CheckResult,
    pub registry: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

async fn check(backend: &str, probe: impl Future<Output = Result<()>>) -> CheckResult {
    let start = Instant::now();
    match probe.await {
        Ok(()) => CheckResult {
            status: "up".to_string(),
            backend: backend.to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => CheckResult {
            status: "down".to_string(),
            backend: backend.to_string(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
    }
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: influencemapper_common::VERSION.to_string(),
    })
}

/// Readiness probe - checks the transport and the session registry
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let registry_backend = format!("{:?}", state.config.registry.kind).to_lowercase();
    let (transport, registry) = tokio::join!(
        check(state.transport.backend(), state.transport.ping()),
        check(&registry_backend, state.registry.ping()),
    );

    let all_healthy = transport.is_up() && registry.is_up();
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks { transport, registry },
        }),
    )
}
