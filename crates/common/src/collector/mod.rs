//! Reply collector
//!
//! One collector task per session:
//!
//! ```text
//! AWAITING_TOTAL -> COLLECTING -> NORMALIZING -> DONE
//!                       |
//!                       +-- idle timeout --> STALLED (partial bundle)
//!                       +-- consumer gone -> CANCELLED
//! ```
//!
//! The task is the only writer of its counter, so the completion check and
//! the increment cannot race. Once the counter reaches the expected total
//! the mailbox is dropped and no further reply is looked at.

pub mod events;
pub mod router;

pub use events::ProgressEvent;
pub use router::{Inbound, Mailbox, ReplyRouter, RouteOutcome};

use crate::bundle::{BundleContents, BundleInfo, BundleStore};
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::models::{Channel, ResultEnvelope, SessionId};
use crate::normalizer::Normalizer;
use crate::registry::SessionStore;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Collector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    AwaitingTotal,
    Collecting,
    Normalizing,
    Done,
    Stalled,
    Cancelled,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectorState::AwaitingTotal => "awaiting_total",
            CollectorState::Collecting => "collecting",
            CollectorState::Normalizing => "normalizing",
            CollectorState::Done => "done",
            CollectorState::Stalled => "stalled",
            CollectorState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A session whose total is known and whose mailbox is claimed
pub struct PreparedSession {
    pub session_id: SessionId,
    pub expected_total: u64,
    mailbox: Mailbox,
}

impl fmt::Debug for PreparedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedSession")
            .field("session_id", &self.session_id)
            .field("expected_total", &self.expected_total)
            .finish_non_exhaustive()
    }
}

/// How a collector run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorReport {
    pub session_id: SessionId,
    pub state: CollectorState,
    pub expected: u64,
    pub received: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub bundle: Option<BundleInfo>,
}

/// Accumulated replies, split by channel
#[derive(Default)]
struct Accumulator {
    seen: HashSet<(Channel, u64)>,
    author: Vec<ResultEnvelope>,
    study: Vec<ResultEnvelope>,
    malformed: u64,
    duplicates: u64,
}

impl Accumulator {
    fn received(&self) -> u64 {
        (self.author.len() + self.study.len()) as u64
    }

    /// Keep a reply unless its key was already seen
    fn accept(&mut self, reply: ResultEnvelope) -> bool {
        if !self.seen.insert(reply.key()) {
            self.duplicates += 1;
            return false;
        }
        match reply.channel() {
            Channel::Author => self.author.push(reply),
            Channel::Study => self.study.push(reply),
        }
        true
    }
}

/// Runs collectors for sessions
#[derive(Clone)]
pub struct Collector {
    registry: Arc<dyn SessionStore>,
    router: Arc<ReplyRouter>,
    normalizer: Normalizer,
    bundles: BundleStore,
    stall_timeout: Duration,
}

impl Collector {
    pub fn new(
        registry: Arc<dyn SessionStore>,
        router: Arc<ReplyRouter>,
        normalizer: Normalizer,
        bundles: BundleStore,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            normalizer,
            bundles,
            stall_timeout,
        }
    }

    pub fn bundles(&self) -> &BundleStore {
        &self.bundles
    }

    /// Look up the expected total and claim the mailbox.
    ///
    /// Fails with `SessionNotFound` for a session that was never registered,
    /// and with `SessionConflict` when another collector holds the mailbox.
    pub async fn prepare(&self, session_id: SessionId) -> Result<PreparedSession> {
        let expected_total =
            self.registry
                .get_expected(session_id)
                .await?
                .ok_or_else(|| AppError::SessionNotFound {
                    id: session_id.to_string(),
                })?;
        let mailbox = self.router.take(session_id)?;

        Ok(PreparedSession {
            session_id,
            expected_total,
            mailbox,
        })
    }

    /// Run a prepared session on a new task, streaming its events
    pub fn spawn(
        &self,
        session: PreparedSession,
        buffer: usize,
    ) -> (mpsc::Receiver<ProgressEvent>, JoinHandle<Result<CollectorReport>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let collector = self.clone();
        let handle = tokio::spawn(async move { collector.run(session, tx).await });
        (rx, handle)
    }

    /// Collect until done, stalled or cancelled.
    ///
    /// Dropping the receiving end of `events` cancels the run at its next
    /// suspension point.
    #[instrument(skip_all, fields(session_id = %session.session_id, expected = session.expected_total))]
    pub async fn run(
        &self,
        session: PreparedSession,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<CollectorReport> {
        let PreparedSession {
            session_id,
            expected_total,
            mut mailbox,
        } = session;
        let started = Instant::now();
        let mut acc = Accumulator::default();

        info!(state = %CollectorState::Collecting, "Collecting replies");
        let mut deadline = tokio::time::Instant::now() + self.stall_timeout;

        while acc.received() < expected_total {
            let inbound = tokio::select! {
                biased;
                _ = events.closed() => {
                    return Ok(self.cancelled(session_id, expected_total, acc, started));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    drop(mailbox);
                    return self
                        .stall(session_id, expected_total, acc, started, &events)
                        .await;
                }
                inbound = mailbox.recv() => inbound,
            };

            match inbound {
                Some(Inbound::Reply(reply)) => {
                    let (id, channel) = (reply.id, reply.channel());
                    if !acc.accept(reply) {
                        warn!(job_id = id, channel = %channel, "Duplicate reply, ignoring");
                        metrics::record_reply("duplicate");
                        continue;
                    }
                    metrics::record_reply("accepted");
                    deadline = tokio::time::Instant::now() + self.stall_timeout;

                    let received = acc.received();
                    debug!(job_id = id, channel = %channel, received, "Reply accepted");
                    let event = ProgressEvent::Progress {
                        id,
                        channel,
                        received,
                        expected: expected_total,
                    };
                    if events.send(event).await.is_err() {
                        return Ok(self.cancelled(session_id, expected_total, acc, started));
                    }
                }
                Some(Inbound::Malformed { reason }) => {
                    warn!(reason = %reason, "Malformed reply, not counted");
                    metrics::record_reply("malformed");
                    acc.malformed += 1;
                }
                None => {
                    let message = "reply routing stopped before the session completed".to_string();
                    error!("{}", message);
                    let _ = events.send(ProgressEvent::Failed { message: message.clone() }).await;
                    return Err(AppError::Transport { message });
                }
            }
        }

        drop(mailbox);
        info!(state = %CollectorState::Normalizing, received = acc.received(), "All replies received");

        let bundle = match self.finish(session_id, expected_total, &acc, true).await {
            Ok(bundle) => bundle,
            Err(e) => return Err(fail(&events, e).await),
        };

        let _ = events
            .send(ProgressEvent::Completed {
                bundle: bundle.name.clone(),
                received: acc.received(),
            })
            .await;

        info!(state = %CollectorState::Done, bundle = %bundle.name, "Session complete");
        metrics::record_session("completed", started.elapsed().as_secs_f64());
        Ok(report(session_id, CollectorState::Done, expected_total, &acc, Some(bundle)))
    }

    async fn stall(
        &self,
        session_id: SessionId,
        expected_total: u64,
        acc: Accumulator,
        started: Instant,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> Result<CollectorReport> {
        warn!(
            state = %CollectorState::Stalled,
            received = acc.received(),
            malformed = acc.malformed,
            timeout_secs = self.stall_timeout.as_secs(),
            "No reply within the stall timeout, writing partial bundle"
        );

        let bundle = match self.finish(session_id, expected_total, &acc, false).await {
            Ok(bundle) => bundle,
            Err(e) => return Err(fail(events, e).await),
        };

        let _ = events
            .send(ProgressEvent::Stalled {
                received: acc.received(),
                expected: expected_total,
                malformed: acc.malformed,
                bundle: Some(bundle.name.clone()),
            })
            .await;

        metrics::record_session("stalled", started.elapsed().as_secs_f64());
        Ok(report(session_id, CollectorState::Stalled, expected_total, &acc, Some(bundle)))
    }

    fn cancelled(
        &self,
        session_id: SessionId,
        expected_total: u64,
        acc: Accumulator,
        started: Instant,
    ) -> CollectorReport {
        info!(state = %CollectorState::Cancelled, received = acc.received(), "Progress consumer went away");
        metrics::record_session("cancelled", started.elapsed().as_secs_f64());
        report(session_id, CollectorState::Cancelled, expected_total, &acc, None)
    }

    async fn finish(
        &self,
        session_id: SessionId,
        expected_total: u64,
        acc: &Accumulator,
        complete: bool,
    ) -> Result<BundleInfo> {
        let study = self.normalizer.normalize_study(&acc.study)?;
        let author = self.normalizer.normalize_author(&acc.author)?;

        self.bundles
            .write(&BundleContents {
                session_id,
                complete,
                expected_total,
                study_results: &acc.study,
                author_results: &acc.author,
                study: &study,
                author: &author,
            })
            .await
    }
}

async fn fail(events: &mpsc::Sender<ProgressEvent>, e: AppError) -> AppError {
    error!(error = %e, "Failed to produce bundle");
    let _ = events
        .send(ProgressEvent::Failed {
            message: e.to_string(),
        })
        .await;
    e
}

fn report(
    session_id: SessionId,
    state: CollectorState,
    expected: u64,
    acc: &Accumulator,
    bundle: Option<BundleInfo>,
) -> CollectorReport {
    CollectorReport {
        session_id,
        state,
        expected,
        received: acc.received(),
        malformed: acc.malformed,
        duplicates: acc.duplicates,
        bundle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobEnvelope, JobPayload, StudyPayload};
    use crate::registry::MemorySessionStore;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        collector: Collector,
        router: Arc<ReplyRouter>,
        registry: Arc<MemorySessionStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(stall: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemorySessionStore::new());
        let router = ReplyRouter::new(Duration::from_secs(60));
        let collector = Collector::new(
            registry.clone(),
            router.clone(),
            Normalizer::standard().unwrap(),
            BundleStore::new(dir.path()),
            stall,
        );
        Harness {
            collector,
            router,
            registry,
            _dir: dir,
        }
    }

    fn reply(session: SessionId, id: u64) -> Vec<u8> {
        let job = JobEnvelope::new(
            session,
            id,
            JobPayload::Study(StudyPayload {
                disclosure: "d".into(),
                title: format!("Paper {}", id),
            }),
        );
        ResultEnvelope::failure(&job, crate::NOT_FINISHED_ERROR).to_bytes().unwrap()
    }

    async fn drain(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_unknown_session_fails_fast() {
        let h = harness(Duration::from_secs(5));
        let err = assert_err!(h.collector.prepare(SessionId::new()).await);
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_second_collector_is_rejected() {
        let h = harness(Duration::from_secs(5));
        let session = SessionId::new();
        h.router.open(session).unwrap();
        h.registry.create(session, 1).await.unwrap();

        let _first = assert_ok!(h.collector.prepare(session).await);
        let err = assert_err!(h.collector.prepare(session).await);
        assert!(matches!(err, AppError::SessionConflict { .. }));
    }

    #[tokio::test]
    async fn test_duplicates_are_not_counted() {
        let h = harness(Duration::from_secs(5));
        let session = SessionId::new();
        h.router.open(session).unwrap();
        h.registry.create(session, 2).await.unwrap();

        h.router.route(&reply(session, 0));
        h.router.route(&reply(session, 0));
        h.router.route(&reply(session, 1));

        let prepared = h.collector.prepare(session).await.unwrap();
        let (rx, handle) = h.collector.spawn(prepared, 16);
        let events = drain(rx).await;
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.state, CollectorState::Done);
        assert_eq!(report.received, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], ProgressEvent::Completed { received: 2, .. }));
        assert!(!h.router.is_open(session));
    }

    #[tokio::test]
    async fn test_zero_expected_completes_immediately() {
        let h = harness(Duration::from_secs(5));
        let session = SessionId::new();
        h.router.open(session).unwrap();
        h.registry.create(session, 0).await.unwrap();

        let prepared = h.collector.prepare(session).await.unwrap();
        let (rx, handle) = h.collector.spawn(prepared, 4);
        let events = drain(rx).await;
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.state, CollectorState::Done);
        assert_eq!(events.len(), 1);
        let bundle = report.bundle.unwrap();
        assert!(bundle.manifest.complete);
        assert!(bundle.path.exists());
    }

    #[tokio::test]
    async fn test_malformed_reply_stalls_with_partial_bundle() {
        let h = harness(Duration::from_millis(200));
        let session = SessionId::new();
        h.router.open(session).unwrap();
        h.registry.create(session, 2).await.unwrap();

        h.router.route(&reply(session, 0));
        let broken = serde_json::to_vec(&json!({ "session_id": session, "id": 1 })).unwrap();
        h.router.route(&broken);

        let prepared = h.collector.prepare(session).await.unwrap();
        let (rx, handle) = h.collector.spawn(prepared, 16);
        let events = drain(rx).await;
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.state, CollectorState::Stalled);
        assert_eq!(report.received, 1);
        assert_eq!(report.malformed, 1);
        match events.last() {
            Some(ProgressEvent::Stalled {
                received,
                expected,
                malformed,
                bundle,
            }) => {
                assert_eq!((*received, *expected, *malformed), (1, 2, 1));
                assert!(bundle.as_deref().unwrap().ends_with("-partial.tar.gz"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropping_consumer_cancels() {
        let h = harness(Duration::from_secs(30));
        let session = SessionId::new();
        h.router.open(session).unwrap();
        h.registry.create(session, 3).await.unwrap();

        let prepared = h.collector.prepare(session).await.unwrap();
        let (rx, handle) = h.collector.spawn(prepared, 4);
        drop(rx);

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.state, CollectorState::Cancelled);
        assert!(!h.router.is_open(session));
    }
}
