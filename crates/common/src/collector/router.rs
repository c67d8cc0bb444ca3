//! Reply router
//!
//! Holds the one subscription to the shared reply topic and hands each
//! reply to the mailbox of the session it names. Mailboxes are opened
//! before a session's jobs are published and buffer until a collector
//! takes them.

use crate::errors::{AppError, Result};
use crate::metrics;
use crate::models::{ResultEnvelope, SessionId};
use crate::transport::{Delivery, Transport};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message delivered to a session's mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Reply(ResultEnvelope),
    /// Names this session but fails envelope validation
    Malformed { reason: String },
}

/// What the router did with one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    DeliveredMalformed,
    /// The session has no open mailbox
    Orphaned,
    /// No session id could be read from the message
    Unattributable,
}

struct Slot {
    tx: mpsc::UnboundedSender<Inbound>,
    /// Present until a collector takes the mailbox
    rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    opened_at: Instant,
}

/// Demultiplexes the reply topic into per-session mailboxes
pub struct ReplyRouter {
    slots: Mutex<HashMap<SessionId, Slot>>,
    unclaimed_ttl: Duration,
}

impl ReplyRouter {
    pub fn new(unclaimed_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            unclaimed_ttl,
        })
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a mailbox for a new session
    pub fn open(&self, session_id: SessionId) -> Result<()> {
        let mut slots = self.slots();
        if slots.contains_key(&session_id) {
            return Err(AppError::SessionConflict {
                id: session_id.to_string(),
                message: "mailbox already open".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        slots.insert(
            session_id,
            Slot {
                tx,
                rx: Some(rx),
                opened_at: Instant::now(),
            },
        );
        debug!(session_id = %session_id, "Mailbox opened");
        Ok(())
    }

    /// Claim a session's mailbox. Only the first caller succeeds.
    pub fn take(self: &Arc<Self>, session_id: SessionId) -> Result<Mailbox> {
        let mut slots = self.slots();
        let slot = slots.get_mut(&session_id).ok_or_else(|| AppError::SessionNotFound {
            id: session_id.to_string(),
        })?;
        let rx = slot.rx.take().ok_or_else(|| AppError::SessionConflict {
            id: session_id.to_string(),
            message: "session already has a collector".to_string(),
        })?;

        Ok(Mailbox {
            session_id,
            rx,
            router: Arc::clone(self),
        })
    }

    /// Close a mailbox; later replies for the session are orphaned
    pub fn close(&self, session_id: SessionId) {
        if self.slots().remove(&session_id).is_some() {
            debug!(session_id = %session_id, "Mailbox closed");
        }
    }

    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.slots().contains_key(&session_id)
    }

    /// Number of open mailboxes
    pub fn open_count(&self) -> usize {
        self.slots().len()
    }

    /// Route one raw reply
    pub fn route(&self, payload: &[u8]) -> RouteOutcome {
        let Some(session_id) = read_session_id(payload) else {
            warn!(bytes = payload.len(), "Reply without a readable session id, discarding");
            metrics::record_reply("orphaned");
            return RouteOutcome::Unattributable;
        };

        let (inbound, outcome) = match ResultEnvelope::from_bytes(payload) {
            Ok(reply) => (Inbound::Reply(reply), RouteOutcome::Delivered),
            Err(e) => (
                Inbound::Malformed { reason: e.to_string() },
                RouteOutcome::DeliveredMalformed,
            ),
        };

        let slots = self.slots();
        let delivered = slots
            .get(&session_id)
            .map(|slot| slot.tx.send(inbound).is_ok())
            .unwrap_or(false);

        if delivered {
            outcome
        } else {
            warn!(session_id = %session_id, "Reply for a closed or unknown session, discarding");
            metrics::record_reply("orphaned");
            RouteOutcome::Orphaned
        }
    }

    /// Drop mailboxes nobody claimed within the TTL
    pub fn prune_unclaimed(&self) -> usize {
        let ttl = self.unclaimed_ttl;
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|session_id, slot| {
            let expired = slot.rx.is_some() && slot.opened_at.elapsed() >= ttl;
            if expired {
                info!(session_id = %session_id, "Pruning unclaimed mailbox");
            }
            !expired
        });
        before - slots.len()
    }

    /// Subscribe to the reply topic and route on a new task.
    ///
    /// The subscription is live when this returns.
    pub async fn spawn(self: &Arc<Self>, transport: Arc<dyn Transport>, topic: &str) -> Result<JoinHandle<()>> {
        let mut stream = transport.subscribe(topic).await?;
        info!(topic = %topic, backend = transport.backend(), "Reply router subscribed");

        let router = Arc::clone(self);
        let prune_every = (router.unclaimed_ttl / 4).max(Duration::from_secs(1));

        Ok(tokio::spawn(async move {
            let mut prune = tokio::time::interval(prune_every);
            prune.tick().await;
            loop {
                tokio::select! {
                    delivery = stream.next() => match delivery {
                        Some(Delivery::Message { payload, .. }) => {
                            router.route(&payload);
                        }
                        Some(Delivery::Subscribed { .. }) => {}
                        None => {
                            warn!("Reply subscription ended");
                            break;
                        }
                    },
                    _ = prune.tick() => {
                        router.prune_unclaimed();
                    }
                }
            }
        }))
    }
}

fn read_session_id(payload: &[u8]) -> Option<SessionId> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("session_id")?.as_str()?.parse().ok()
}

/// A claimed mailbox. Dropping it closes the session's routing.
pub struct Mailbox {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<Inbound>,
    router: Arc<ReplyRouter>,
}

impl Mailbox {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next message; `None` once the router has closed the mailbox
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.router.close(self.session_id);
    }
}
