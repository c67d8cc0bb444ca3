//! InfluenceMapper API Gateway
//!
//! The entry point for uploads and their results.
//! Handles:
//! - Table uploads and job fan-out
//! - Per-session progress streams (SSE)
//! - Bundle downloads
//! - Rate limiting and observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use influencemapper_common::{
    bundle::BundleStore,
    collector::{Collector, ReplyRouter},
    config::AppConfig,
    emitter::JobEmitter,
    errors::Result,
    metrics,
    normalizer::Normalizer,
    pipeline::UploadService,
    registry::{create_session_store, SessionStore},
    transport::{create_transport, Transport},
};
use middleware::rate_limit::{rate_limit_middleware, UploadLimiter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn SessionStore>,
    pub uploads: UploadService,
    pub collector: Collector,
}

impl AppState {
    /// Wire the pipeline and start the reply router.
    ///
    /// The returned handle is the router's subscription task; the gateway
    /// cannot collect anything once it exits.
    pub async fn build(
        config: Arc<AppConfig>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn SessionStore>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let router = ReplyRouter::new(config.unclaimed_ttl());
        let router_task = router
            .spawn(transport.clone(), &config.channels.replies)
            .await?;

        let uploads = UploadService::new(
            JobEmitter::new(transport.clone(), config.channels.clone()),
            registry.clone(),
            router.clone(),
        );
        let collector = Collector::new(
            registry.clone(),
            router,
            Normalizer::standard()?,
            BundleStore::new(&config.bundle.dir),
            config.stall_timeout(),
        );

        Ok((
            Self {
                config,
                transport,
                registry,
                uploads,
                collector,
            },
            router_task,
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;
    let config = Arc::new(config);

    // Initialize tracing
    init_tracing(&config);

    info!(
        service = %config.observability.service_name,
        "Starting InfluenceMapper API Gateway v{}",
        influencemapper_common::VERSION
    );

    // Initialize metrics
    metrics::register_metrics();
    metrics::install_exporter(&config.server.host, config.observability.metrics_port)?;

    let transport = create_transport(&config).await?;
    let registry = create_session_store(&config).await?;
    tokio::fs::create_dir_all(&config.bundle.dir).await?;

    let (state, router_task) = AppState::build(config.clone(), transport, registry).await?;

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Open progress streams hold connections; bound the drain after the signal
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });
    let server = tokio::spawn(async move { serve.await });

    // The sender is dropped without sending when the server exits on its own
    if signal_rx.await.is_ok() {
        if !drain(server, config.shutdown_timeout()).await? {
            warn!(
                timeout_secs = config.server.shutdown_timeout_secs,
                "Connections still open at the shutdown deadline, closing them"
            );
        }
    } else {
        server.await??;
    }

    router_task.abort();
    info!(service = %config.observability.service_name, "Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let config = state.config.clone();

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Uploads are bounded in size, time and rate; progress streams are not
    let upload_limiter = UploadLimiter::from_config(&config.rate_limit);
    let upload_routes = Router::new()
        .route("/uploads", post(handlers::upload::create_upload))
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(axum::middleware::from_fn_with_state(
            upload_limiter,
            rate_limit_middleware,
        ));

    let api_routes = Router::new()
        .route("/sessions/{id}/events", get(handlers::sessions::session_events))
        .route("/bundles/{name}", get(handlers::bundles::download_bundle))
        .merge(upload_routes);

    // Compose the app
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Wait for the server to drain, aborting it at the deadline.
///
/// Returns `false` when the deadline cut the drain short.
async fn drain(mut server: JoinHandle<std::io::Result<()>>, deadline: Duration) -> anyhow::Result<bool> {
    match tokio::time::timeout(deadline, &mut server).await {
        Ok(result) => {
            result??;
            Ok(true)
        }
        Err(_) => {
            server.abort();
            Ok(false)
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use influencemapper_common::{
        inference::mock::{MockInferenceBackend, MockResponse},
        models::Channel,
        registry::MemorySessionStore,
        transport::in_memory::MemoryTransport,
        worker::{InferenceWorker, WorkerSettings},
    };
    use tower::ServiceExt;

    const UPLOAD: &str = "\
Title,Author Name,Affiliation,Email,Disclosure Statement
Paper A,Dr. John Smith,MIT,js@mit.edu,Funded by the National Cancer Institute.
";

    struct TestApp {
        app: Router,
        tasks: Vec<JoinHandle<()>>,
        _dir: tempfile::TempDir,
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            for task in &self.tasks {
                task.abort();
            }
        }
    }

    async fn test_app() -> TestApp {
        test_app_with(AppConfig::default()).await
    }

    async fn test_app_with(mut config: AppConfig) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        config.bundle.dir = dir.path().to_string_lossy().into_owned();
        config.collector.stall_timeout_secs = 10;
        let config = Arc::new(config);

        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::default());
        let registry: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let (state, router_task) = AppState::build(config.clone(), transport.clone(), registry)
            .await
            .unwrap();

        let backend = MockInferenceBackend::new().with_channel_response(
            Channel::Study,
            MockResponse::complete(
                r#"{"organizations":[{"org_name":"National Cancer Institute","relationships":[{"relationship_type":"Received research grant funds directly"}]}]}"#,
            ),
        );
        let settings = WorkerSettings::from_config(&config).with_retry_interval(Duration::from_millis(1));
        let worker = Arc::new(InferenceWorker::new(transport, Arc::new(backend), settings));

        let mut tasks = vec![router_task];
        for channel in Channel::ALL {
            tasks.push(worker.clone().start(channel).await.unwrap());
        }

        TestApp {
            app: create_router(state),
            tasks,
            _dir: dir,
        }
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn upload(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/uploads")
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_drain_stops_at_the_deadline() {
        let finished = tokio::spawn(async { Ok(()) });
        assert!(drain(finished, Duration::from_secs(1)).await.unwrap());

        let stuck = tokio::spawn(std::future::pending::<std::io::Result<()>>());
        assert!(!drain(stuck, Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_health() {
        let test = test_app().await;
        let response = test.app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("healthy"));

        let response = test.app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_stream_and_download() {
        let test = test_app().await;

        let response = test.app.clone().oneshot(upload(UPLOAD)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("x-request-id"));
        let receipt: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(receipt["expected_total"], 2);
        let events_url = receipt["events_url"].as_str().unwrap().to_string();

        let response = test.app.clone().oneshot(get(&events_url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stream = tokio::time::timeout(Duration::from_secs(10), body_text(response))
            .await
            .unwrap();
        assert_eq!(stream.matches("event: progress").count(), 2);
        assert!(stream.contains("event: completed"));

        let session_id = receipt["session_id"].as_str().unwrap();
        let bundle = format!("/v1/bundles/{}.tar.gz", session_id);
        let response = test.app.clone().oneshot(get(&bundle)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/gzip");
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let test = test_app().await;
        let response = test.app.clone().oneshot(upload("")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let mut config = AppConfig::default();
        config.server.max_upload_bytes = 64;
        let test = test_app_with(config).await;

        let response = test.app.clone().oneshot(upload(UPLOAD)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let test = test_app().await;
        let unknown = "/v1/sessions/00000000-0000-4000-8000-000000000000/events";
        let response = test.app.clone().oneshot(get(unknown)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = test.app.clone().oneshot(get("/v1/sessions/not-a-session/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bundle_names_validated() {
        let test = test_app().await;
        let response = test.app.clone().oneshot(get("/v1/bundles/notes.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = test.app.clone().oneshot(get("/v1/bundles/missing.tar.gz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
