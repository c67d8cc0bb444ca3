//! Redis pub/sub transport

use super::{Delivery, DeliveryStream, Transport};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::debug;

/// Redis pub/sub client.
///
/// Publishing goes through a reconnecting connection manager; every
/// subscription opens its own dedicated pub/sub connection.
pub struct RedisTransport {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisTransport {
    /// Connect to Redis
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::Transport {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| AppError::Transport {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| AppError::Transport {
                message: format!("Failed to publish to '{}': {}", topic, e),
            })?;

        debug!(topic = %topic, receivers, "Message published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| AppError::Transport {
                message: format!("Failed to open pub/sub connection: {}", e),
            })?;

        pubsub.subscribe(topic).await.map_err(|e| AppError::Transport {
            message: format!("Failed to subscribe to '{}': {}", topic, e),
        })?;

        debug!(topic = %topic, "Subscribed");

        let confirmed = stream::once(futures::future::ready(Delivery::Subscribed {
            topic: topic.to_string(),
        }));
        let messages = pubsub.into_on_message().map(|msg| Delivery::Message {
            topic: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });

        Ok(confirmed.chain(messages).boxed())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.publisher.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::Transport {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
