//! InfluenceMapper Inference Worker
//!
//! Serves the job topics of the configured channels:
//! 1. Receives a job envelope from the transport
//! 2. Builds the channel's prompt and calls the inference backend
//! 3. Publishes a result envelope on the shared reply topic
//!
//! `inference-worker test <author|study> <title> <disclosure> [author...]`
//! runs one job against the configured backend and prints the reply.

use influencemapper_common::{
    config::AppConfig,
    errors::{AppError, Result},
    inference::create_backend,
    metrics,
    models::{AuthorPayload, Channel, JobEnvelope, JobPayload, SessionId, StudyPayload},
    transport::create_transport,
    worker::{InferenceWorker, WorkerSettings},
    VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Consecutive subscription failures before the circuit opens
const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;
    let config = Arc::new(config);

    // Initialize tracing
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

    info!(
        service = %config.observability.service_name,
        "Starting InfluenceMapper Inference Worker v{}",
        VERSION
    );

    // Initialize inference backend
    let backend = create_backend(&config.inference)?;
    info!(
        provider = %config.inference.provider,
        model = %backend.model_name(),
        "Inference backend initialized"
    );

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "test" {
        // Test mode: run a single job without a transport
        info!("Running in test mode...");
        let payload = parse_test_job(&args[2..])?;
        let job = JobEnvelope::new(SessionId::new(), 0, payload);

        let transport = influencemapper_common::transport::in_memory::MemoryTransport::default();
        let worker = InferenceWorker::new(
            Arc::new(transport),
            backend,
            WorkerSettings::from_config(&config),
        );
        let reply = worker.handle_job(&job).await;
        println!("{}", serde_json::to_string_pretty(&reply)?);

        return Ok(());
    }

    // Service mode: serve every configured channel
    metrics::register_metrics();
    metrics::install_exporter(&config.server.host, config.observability.metrics_port)?;

    let transport = create_transport(&config).await?;
    let worker = Arc::new(InferenceWorker::new(
        transport,
        backend,
        WorkerSettings::from_config(&config),
    ));

    let supervisors: Vec<_> = config
        .worker
        .channels
        .iter()
        .copied()
        .map(|channel| tokio::spawn(supervise(worker.clone(), channel)))
        .collect();

    if supervisors.is_empty() {
        warn!("No channels configured, waiting for shutdown signal...");
    } else {
        info!(channels = ?config.worker.channels, "Inference worker ready");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for supervisor in &supervisors {
        supervisor.abort();
    }

    info!("Inference worker shutting down");
    Ok(())
}

/// Keep one channel subscribed, resubscribing when the stream ends
async fn supervise(worker: Arc<InferenceWorker>, channel: Channel) {
    let mut consecutive_failures = 0;

    loop {
        // Circuit breaker check
        if consecutive_failures >= MAX_FAILURES {
            warn!(
                channel = %channel,
                failures = consecutive_failures,
                "Circuit breaker open, pausing..."
            );
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            consecutive_failures = 0;
            info!(channel = %channel, "Circuit breaker reset, resuming...");
        }

        match worker.clone().start(channel).await {
            Ok(handle) => {
                consecutive_failures = 0;
                if let Err(e) = handle.await {
                    error!(channel = %channel, error = %e, "Channel task panicked");
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    channel = %channel,
                    error = %e,
                    failures = consecutive_failures,
                    "Failed to subscribe to job topic"
                );
            }
        }

        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

/// Build a job payload from `<channel> <title> <disclosure> [author...]`
fn parse_test_job(args: &[String]) -> Result<JobPayload> {
    let usage = || AppError::Validation {
        message: "usage: test <author|study> <title> <disclosure> [author...]".to_string(),
        field: None,
    };

    let (channel, title, disclosure, authors) = match args {
        [channel, title, disclosure, authors @ ..] => (channel.parse::<Channel>()?, title, disclosure, authors),
        _ => return Err(usage()),
    };

    Ok(match channel {
        Channel::Study => JobPayload::Study(StudyPayload {
            disclosure: disclosure.clone(),
            title: title.clone(),
        }),
        Channel::Author => {
            if authors.is_empty() {
                return Err(usage());
            }
            JobPayload::Author(AuthorPayload {
                authors: authors.to_vec(),
                disclosure: disclosure.clone(),
                title: title.clone(),
                affiliations: Vec::new(),
                emails: Vec::new(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_study_job() {
        let payload = parse_test_job(&args(&["study", "Paper A", "Funded by NIH."])).unwrap();
        assert_eq!(payload.channel(), Channel::Study);
        assert_eq!(payload.title(), "Paper A");
        assert_eq!(payload.disclosure(), "Funded by NIH.");
    }

    #[test]
    fn test_parse_author_job() {
        let payload = parse_test_job(&args(&[
            "author",
            "Paper A",
            "Dr. Smith consults for Pfizer.",
            "Dr. John Smith",
            "Dr. Emily Johnson",
        ]))
        .unwrap();
        match payload {
            JobPayload::Author(author) => assert_eq!(author.authors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_err!(parse_test_job(&args(&["study", "Paper A"])));
        assert_err!(parse_test_job(&args(&["author", "Paper A", "No authors listed."])));
        assert_err!(parse_test_job(&args(&["citation", "Paper A", "Funded by NIH."])));
    }
}
