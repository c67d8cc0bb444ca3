//! In-process broadcast transport
//!
//! Mirrors Redis pub/sub semantics: fan-out to every live subscriber,
//! silent loss when nobody listens, loss under lag.

use super::{Delivery, DeliveryStream, Transport};
use crate::errors::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Broadcast-channel-backed transport
pub struct MemoryTransport {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
    #[cfg(test)]
    failing_publishes: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            #[cfg(test)]
            failing_publishes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` publishes fail
    #[cfg(test)]
    pub(crate) fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        #[cfg(test)]
        if self.take_injected_failure() {
            return Err(crate::errors::AppError::Transport {
                message: format!("Injected publish failure on '{}'", topic),
            });
        }

        match self.sender(topic).send(payload) {
            Ok(receivers) => debug!(topic = %topic, receivers, "Message published"),
            Err(_) => debug!(topic = %topic, "Message published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream> {
        let mut rx = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = async_stream::stream! {
            yield Delivery::Subscribed { topic: topic.clone() };
            loop {
                match rx.recv().await {
                    Ok(payload) => yield Delivery::Message { topic: topic.clone(), payload },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_after_confirmation() {
        let transport = MemoryTransport::new(16);
        let mut a = transport.subscribe("t").await.unwrap();
        let mut b = transport.subscribe("t").await.unwrap();
        assert_eq!(transport.subscriber_count("t"), 2);

        transport.publish("t", b"hello".to_vec()).await.unwrap();

        for sub in [&mut a, &mut b] {
            assert_eq!(
                sub.next().await,
                Some(Delivery::Subscribed { topic: "t".into() })
            );
            assert_eq!(
                sub.next().await,
                Some(Delivery::Message { topic: "t".into(), payload: b"hello".to_vec() })
            );
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_lost() {
        let transport = MemoryTransport::new(16);
        tokio_test::assert_ok!(transport.publish("t", b"early".to_vec()).await);

        let mut sub = transport.subscribe("t").await.unwrap();
        transport.publish("t", b"late".to_vec()).await.unwrap();
        sub.next().await;
        assert_eq!(
            sub.next().await,
            Some(Delivery::Message { topic: "t".into(), payload: b"late".to_vec() })
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let transport = MemoryTransport::new(16);
        transport.fail_next_publishes(1);
        tokio_test::assert_err!(transport.publish("t", vec![1]).await);
        tokio_test::assert_ok!(transport.publish("t", vec![2]).await);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let transport = MemoryTransport::new(16);
        let mut sub = transport.subscribe("a").await.unwrap();
        transport.publish("b", vec![9]).await.unwrap();
        transport.publish("a", vec![1]).await.unwrap();
        sub.next().await;
        assert_eq!(
            sub.next().await,
            Some(Delivery::Message { topic: "a".into(), payload: vec![1] })
        );
    }
}
