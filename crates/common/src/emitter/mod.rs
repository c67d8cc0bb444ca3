//! Job emitter
//!
//! Turns grouped payloads into job envelopes and publishes them on the
//! channel's job topic. Ids run `0..N-1` per call and per channel; nothing
//! lines author ids up with study ids.
//!
//! Publishing is not retried here. Each publish runs as its own task and
//! the caller settles the emission to learn which jobs actually went out.

use crate::config::ChannelsConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::models::{Channel, JobEnvelope, JobPayload, SessionId};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One job handed to the transport
pub struct EmittedJob {
    pub id: u64,
    handle: JoinHandle<Result<()>>,
}

/// Ids and pending publishes for one channel of one session
pub struct Emission {
    pub session_id: SessionId,
    pub channel: Channel,
    jobs: Vec<EmittedJob>,
}

/// Settled publish results for one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmissionReport {
    pub published: Vec<u64>,
    pub failed: Vec<(u64, String)>,
}

impl EmissionReport {
    pub fn published_count(&self) -> u64 {
        self.published.len() as u64
    }
}

impl Emission {
    /// Assigned ids in emission order
    pub fn ids(&self) -> Vec<u64> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wait for every publish to finish.
    ///
    /// A publish task that panicked or was aborted counts as failed.
    pub async fn settle(self) -> EmissionReport {
        let mut report = EmissionReport::default();
        for job in self.jobs {
            match job.handle.await {
                Ok(Ok(())) => report.published.push(job.id),
                Ok(Err(e)) => report.failed.push((job.id, e.to_string())),
                Err(e) => report.failed.push((job.id, format!("publish task failed: {}", e))),
            }
        }

        info!(
            session_id = %self.session_id,
            channel = %self.channel,
            published = report.published.len(),
            failed = report.failed.len(),
            "Emission settled"
        );
        report
    }
}

/// Publishes job envelopes on the per-class job topics
#[derive(Clone)]
pub struct JobEmitter {
    transport: Arc<dyn Transport>,
    channels: ChannelsConfig,
}

impl JobEmitter {
    pub fn new(transport: Arc<dyn Transport>, channels: ChannelsConfig) -> Self {
        Self { transport, channels }
    }

    /// Emit one job per payload on `channel`.
    ///
    /// Every payload must belong to `channel`; a mismatch rejects the whole
    /// batch before anything is published.
    pub fn emit(
        &self,
        session_id: SessionId,
        channel: Channel,
        payloads: Vec<JobPayload>,
    ) -> Result<Emission> {
        if let Some(bad) = payloads.iter().position(|p| p.channel() != channel) {
            return Err(AppError::Validation {
                message: format!("Payload {} is not a {} payload", bad, channel),
                field: Some("channel".to_string()),
            });
        }

        let topic = self.channels.job_topic(channel).to_string();
        let jobs = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let job = JobEnvelope::new(session_id, index as u64, payload);
                let id = job.id;
                let transport = Arc::clone(&self.transport);
                let topic = topic.clone();
                let handle = tokio::spawn(async move { publish_job(transport, topic, job).await });
                EmittedJob { id, handle }
            })
            .collect();

        Ok(Emission {
            session_id,
            channel,
            jobs,
        })
    }
}

async fn publish_job(transport: Arc<dyn Transport>, topic: String, job: JobEnvelope) -> Result<()> {
    let channel = job.channel();
    let body = job.to_bytes()?;

    match transport.publish(&topic, body).await {
        Ok(()) => {
            debug!(session_id = %job.session_id, channel = %channel, job_id = job.id, "Job published");
            metrics::record_job_emitted(channel, true);
            Ok(())
        }
        Err(e) => {
            error!(
                session_id = %job.session_id,
                channel = %channel,
                job_id = job.id,
                error = %e,
                "Failed to publish job"
            );
            metrics::record_job_emitted(channel, false);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StudyPayload;
    use crate::transport::{Delivery, MemoryTransport};
    use futures::StreamExt;

    fn study(title: &str) -> JobPayload {
        JobPayload::Study(StudyPayload {
            disclosure: format!("{} disclosure", title),
            title: title.to_string(),
        })
    }

    #[tokio::test]
    async fn test_ids_start_at_zero_per_channel() {
        let transport = Arc::new(MemoryTransport::default());
        let emitter = JobEmitter::new(transport.clone(), ChannelsConfig::default());
        let mut sub = transport.subscribe("study_channel").await.unwrap();
        assert!(matches!(sub.next().await, Some(Delivery::Subscribed { .. })));

        let session = SessionId::new();
        let emission = emitter
            .emit(session, Channel::Study, vec![study("A"), study("B"), study("C")])
            .unwrap();
        assert_eq!(emission.ids(), vec![0, 1, 2]);

        let report = emission.settle().await;
        assert_eq!(report.published_count(), 3);
        assert!(report.failed.is_empty());

        let mut seen = Vec::new();
        for _ in 0..3 {
            match sub.next().await {
                Some(Delivery::Message { payload, .. }) => {
                    let job = JobEnvelope::from_bytes(&payload).unwrap();
                    assert_eq!(job.session_id, session);
                    seen.push(job.id);
                }
                other => panic!("unexpected delivery {:?}", other),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failed_publish_is_reported() {
        let transport = Arc::new(MemoryTransport::default());
        transport.fail_next_publishes(1);
        let emitter = JobEmitter::new(transport, ChannelsConfig::default());

        let report = emitter
            .emit(SessionId::new(), Channel::Study, vec![study("A")])
            .unwrap()
            .settle()
            .await;
        assert_eq!(report.published_count(), 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 0);
    }

    #[tokio::test]
    async fn test_channel_mismatch_rejects_batch() {
        let emitter = JobEmitter::new(Arc::new(MemoryTransport::default()), ChannelsConfig::default());
        let result = emitter.emit(SessionId::new(), Channel::Author, vec![study("A")]);
        assert!(matches!(result, Err(AppError::Validation { .. })));
    }
}
