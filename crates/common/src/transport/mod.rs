//! Pub/sub transport for job and result envelopes
//!
//! Provides:
//! - A transport trait with topic publish and subscribe
//! - Redis pub/sub backend
//! - In-process broadcast backend for tests and single-process runs
//!
//! Delivery is at-most-once: a message published while nobody is
//! subscribed is gone, and ordering holds only within one topic.

pub mod in_memory;
pub mod redis_pubsub;

pub use in_memory::MemoryTransport;
pub use redis_pubsub::RedisTransport;

use crate::config::{AppConfig, TransportKind};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Item yielded by a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Subscription confirmation; carries no data
    Subscribed { topic: String },
    /// A published message
    Message { topic: String, payload: Vec<u8> },
}

/// Stream of deliveries for one subscription
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Publish/subscribe capability shared by every component
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish raw bytes on a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic. The subscription is live once this returns.
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream>;

    /// Check connectivity
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// Serialize a message and publish it
pub async fn publish_json<T: Serialize + ?Sized>(
    transport: &dyn Transport,
    topic: &str,
    message: &T,
) -> Result<()> {
    let body = serde_json::to_vec(message).map_err(|e| AppError::Transport {
        message: format!("Failed to serialize message: {}", e),
    })?;
    transport.publish(topic, body).await
}

/// Create the transport selected by configuration
pub async fn create_transport(config: &AppConfig) -> Result<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Redis => {
            info!(url = %config.redis.url, "Connecting to Redis pub/sub...");
            let transport = RedisTransport::connect(&config.redis.url).await?;
            Ok(Arc::new(transport))
        }
        TransportKind::Memory => {
            info!("Using in-process transport");
            Ok(Arc::new(MemoryTransport::new(config.transport.broadcast_capacity)))
        }
    }
}
