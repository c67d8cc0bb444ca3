//! Mock inference backend for deterministic testing.
//!
//! Responses are scripted per channel, optionally overridden for requests
//! whose prompt contains a given needle (a title, an author name).
//!
//! ```rust,ignore
//! let backend = MockInferenceBackend::new()
//!     .with_channel_response(Channel::Study, MockResponse::complete(r#"{"organizations":[]}"#))
//!     .with_response_mapping("Paper B", MockResponse::NotFinished(FinishReason::Length));
//! ```

use super::{FinishReason, InferenceBackend, InferenceOutcome, InferenceRequest};
use crate::errors::{AppError, Result};
use crate::models::Channel;
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Scripted behaviour for one request
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Normal completion with the given content
    Complete(String),
    /// Returned, but with a non-stop finish reason
    NotFinished(FinishReason),
    /// The call itself fails
    Fail(String),
}

impl MockResponse {
    pub fn complete(content: impl Into<String>) -> Self {
        MockResponse::Complete(content.into())
    }
}

/// Mock inference backend for testing.
#[derive(Clone)]
pub struct MockInferenceBackend {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    author_response: MockResponse,
    study_response: MockResponse,
    mappings: Vec<(String, MockResponse)>,
    latency_ms: u64,
    failure_rate: f64,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub channel: Channel,
    pub prompt: String,
    pub timestamp: Instant,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            author_response: MockResponse::complete(r#"{"authors":[]}"#),
            study_response: MockResponse::complete(r#"{"organizations":[]}"#),
            mappings: Vec::new(),
            latency_ms: 0,
            failure_rate: 0.0,
        }
    }
}

impl MockInferenceBackend {
    /// Create a new mock backend that answers with empty results.
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the default response for a channel.
    pub fn with_channel_response(mut self, channel: Channel, response: MockResponse) -> Self {
        let config = Arc::make_mut(&mut self.config);
        match channel {
            Channel::Author => config.author_response = response,
            Channel::Study => config.study_response = response,
        }
        self
    }

    /// Respond with `response` whenever the user prompt contains `needle`.
    /// Earlier mappings win.
    pub fn with_response_mapping(mut self, needle: impl Into<String>, response: MockResponse) -> Self {
        Arc::make_mut(&mut self.config)
            .mappings
            .push((needle.into(), response));
        self
    }

    /// Set simulated latency for every call.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Set failure rate (0.0 - 1.0) for testing error handling.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        Arc::make_mut(&mut self.config).failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Get all logged calls for assertion.
    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls made for a channel.
    pub fn call_count(&self, channel: Channel) -> usize {
        self.calls().iter().filter(|c| c.channel == channel).count()
    }

    fn scripted(&self, request: &InferenceRequest) -> MockResponse {
        self.config
            .mappings
            .iter()
            .find(|(needle, _)| request.user.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| match request.channel {
                Channel::Author => self.config.author_response.clone(),
                Channel::Study => self.config.study_response.clone(),
            })
    }
}

impl Default for MockInferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for MockInferenceBackend {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutcome> {
        self.call_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall {
                channel: request.channel,
                prompt: request.user.clone(),
                timestamp: Instant::now(),
            });

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        if self.config.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.config.failure_rate {
            return Err(AppError::Inference {
                message: "Simulated random failure".to_string(),
            });
        }

        match self.scripted(request) {
            MockResponse::Complete(content) => Ok(InferenceOutcome::stop(content)),
            MockResponse::NotFinished(finish_reason) => Ok(InferenceOutcome {
                finish_reason,
                content: String::new(),
            }),
            MockResponse::Fail(message) => Err(AppError::Inference { message }),
        }
    }

    fn model_name(&self) -> &str {
        "mock-inference"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(channel: Channel, user: &str) -> InferenceRequest {
        InferenceRequest {
            channel,
            system: String::new(),
            user: user.to_string(),
        }
    }

    #[tokio::test]
    async fn test_default_responses_are_empty_results() {
        let backend = MockInferenceBackend::new();
        let outcome = backend.infer(&request(Channel::Study, "x")).await.unwrap();
        assert!(outcome.finish_reason.is_stop());
        assert_eq!(outcome.content, r#"{"organizations":[]}"#);
    }

    #[tokio::test]
    async fn test_mapping_overrides_channel_default() {
        let backend = MockInferenceBackend::new()
            .with_response_mapping("Paper B", MockResponse::NotFinished(FinishReason::Length));

        let a = backend.infer(&request(Channel::Author, "Title: Paper A")).await.unwrap();
        let b = backend.infer(&request(Channel::Author, "Title: Paper B")).await.unwrap();
        assert!(a.finish_reason.is_stop());
        assert_eq!(b.finish_reason, FinishReason::Length);
        assert_eq!(backend.call_count(Channel::Author), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let backend = MockInferenceBackend::new()
            .with_channel_response(Channel::Study, MockResponse::Fail("down".into()));
        tokio_test::assert_err!(backend.infer(&request(Channel::Study, "")).await);
    }

    #[tokio::test]
    async fn test_full_failure_rate() {
        let backend = MockInferenceBackend::new().with_failure_rate(1.0);
        tokio_test::assert_err!(backend.infer(&request(Channel::Author, "")).await);
    }
}
