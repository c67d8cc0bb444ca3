//! Inference worker
//!
//! Serves one job topic: every valid job yields exactly one result envelope
//! on the shared reply topic, whatever happens to the inference call.
//!
//! Outcome classification:
//! - normal stop with content that parses for the channel: payload reply
//! - normal stop with unparseable content: `MALFORMED_CONTENT_ERROR`
//! - any other finish reason: `NOT_FINISHED_ERROR`
//! - call failure after retries: `NOT_FINISHED_ERROR`

use crate::config::{AppConfig, ChannelsConfig};
use crate::errors::{AppError, Result};
use crate::inference::{prompts, InferenceBackend, InferenceOutcome};
use crate::metrics;
use crate::models::{Channel, JobEnvelope, ResultEnvelope, ResultPayload};
use crate::transport::{Delivery, DeliveryStream, Transport};
use crate::{MALFORMED_CONTENT_ERROR, NOT_FINISHED_ERROR};
use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub channels: ChannelsConfig,
    pub max_concurrent_jobs: usize,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            channels: config.channels.clone(),
            max_concurrent_jobs: config.worker.max_concurrent_jobs.max(1),
            max_retries: config.inference.max_retries,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Override the first backoff interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Stateless job processor shared by every channel task
pub struct InferenceWorker {
    transport: Arc<dyn Transport>,
    backend: Arc<dyn InferenceBackend>,
    settings: WorkerSettings,
}

impl InferenceWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn InferenceBackend>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            transport,
            backend,
            settings,
        }
    }

    /// Subscribe to a channel's job topic and serve it on a new task.
    ///
    /// The subscription is live when this returns.
    pub async fn start(self: Arc<Self>, channel: Channel) -> Result<JoinHandle<()>> {
        let topic = self.settings.channels.job_topic(channel).to_string();
        let stream = self.transport.subscribe(&topic).await?;
        info!(
            channel = %channel,
            topic = %topic,
            model = self.backend.model_name(),
            concurrency = self.settings.max_concurrent_jobs,
            "Worker subscribed"
        );

        Ok(tokio::spawn(async move {
            self.serve(channel, stream).await;
            warn!(channel = %channel, "Job subscription ended");
        }))
    }

    /// Process jobs until the subscription ends
    pub async fn serve(&self, channel: Channel, stream: DeliveryStream) {
        stream
            .filter_map(|delivery| async move { decode_job(channel, delivery) })
            .for_each_concurrent(self.settings.max_concurrent_jobs, |job| async move {
                let reply = self.handle_job(&job).await;
                if let Err(e) = self.publish_reply(&reply).await {
                    error!(
                        session_id = %reply.session_id,
                        channel = %channel,
                        job_id = reply.id,
                        error = %e,
                        "Failed to publish reply, job lost"
                    );
                }
            })
            .await;
    }

    /// Run inference for one job and build its reply
    #[instrument(skip(self, job), fields(session_id = %job.session_id, channel = %job.channel(), job_id = job.id))]
    pub async fn handle_job(&self, job: &JobEnvelope) -> ResultEnvelope {
        let channel = job.channel();
        let start = Instant::now();
        let outcome = self.infer_with_retry(job).await;
        let elapsed = start.elapsed().as_secs_f64();

        let (reply, kind) = classify(job, outcome);
        metrics::record_worker_outcome(channel, kind, elapsed);
        debug!(outcome = kind, elapsed_secs = elapsed, "Job processed");
        reply
    }

    async fn infer_with_retry(&self, job: &JobEnvelope) -> Result<InferenceOutcome> {
        let request = prompts::build_prompt(&job.payload);
        let backend = &self.backend;
        let request = &request;
        let max_retries = self.settings.max_retries;
        let mut attempt = 0u32;

        backoff::future::retry(self.backoff_policy(), || {
            attempt += 1;
            let this_attempt = attempt;
            async move {
                backend.infer(request).await.map_err(|e| {
                    if e.is_transient() && this_attempt <= max_retries {
                        warn!(attempt = this_attempt, error = %e, "Inference call failed, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    async fn publish_reply(&self, reply: &ResultEnvelope) -> Result<()> {
        let topic = self.settings.channels.replies.as_str();
        let body = reply.to_bytes()?;
        let transport = &self.transport;
        let body = &body;
        let max_retries = self.settings.max_retries;
        let mut attempt = 0u32;

        backoff::future::retry(self.backoff_policy(), || {
            attempt += 1;
            let this_attempt = attempt;
            async move {
                transport.publish(topic, body.clone()).await.map_err(|e| {
                    if this_attempt <= max_retries {
                        warn!(attempt = this_attempt, error = %e, "Reply publish failed, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    fn backoff_policy(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.settings.retry_interval)
            .with_max_interval(MAX_RETRY_INTERVAL)
            .with_max_elapsed_time(None)
            .build()
    }
}

fn decode_job(channel: Channel, delivery: Delivery) -> Option<JobEnvelope> {
    let payload = match delivery {
        Delivery::Subscribed { .. } => return None,
        Delivery::Message { payload, .. } => payload,
    };

    match JobEnvelope::from_bytes(&payload) {
        Ok(job) if job.channel() == channel => Some(job),
        Ok(job) => {
            warn!(
                channel = %channel,
                session_id = %job.session_id,
                job_id = job.id,
                job_channel = %job.channel(),
                "Job delivered on the wrong topic, skipping"
            );
            None
        }
        Err(e) => {
            warn!(channel = %channel, error = %e, "Invalid job envelope, skipping");
            None
        }
    }
}

fn classify(job: &JobEnvelope, outcome: Result<InferenceOutcome>) -> (ResultEnvelope, &'static str) {
    match outcome {
        Ok(outcome) if !outcome.finish_reason.is_stop() => {
            warn!(finish_reason = ?outcome.finish_reason, "Inference did not finish");
            (ResultEnvelope::failure(job, NOT_FINISHED_ERROR), "not_finished")
        }
        Ok(outcome) => match ResultPayload::parse(job.channel(), &outcome.content) {
            Ok(payload) => (ResultEnvelope::success(job, payload), "parsed"),
            Err(e) => {
                warn!(error = %e, "Inference content does not match the result shape");
                (ResultEnvelope::failure(job, MALFORMED_CONTENT_ERROR), "unparseable")
            }
        },
        Err(e) => {
            log_call_failure(&e);
            (ResultEnvelope::failure(job, NOT_FINISHED_ERROR), "call_failed")
        }
    }
}

fn log_call_failure(e: &AppError) {
    error!(error = %e, code = e.code().as_code(), "Inference call failed");
}
