//! Inference backend abstraction
//!
//! Provides a unified interface over language-model providers:
//! - OpenAI-compatible chat completions
//! - Scripted mock backend for tests and dry runs

pub mod mock;
pub mod openai;
pub mod prompts;

pub use mock::{MockInferenceBackend, MockResponse};
pub use openai::OpenAiBackend;

use crate::config::InferenceConfig;
use crate::errors::{AppError, Result};
use crate::models::Channel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Prompt for one inference call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceRequest {
    pub channel: Channel,
    pub system: String,
    pub user: String,
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Only a normal stop yields usable content
    pub fn is_stop(&self) -> bool {
        matches!(self, FinishReason::Stop)
    }
}

impl From<String> for FinishReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Other(s),
        }
    }
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Stop => "stop".to_string(),
            FinishReason::Length => "length".to_string(),
            FinishReason::ContentFilter => "content_filter".to_string(),
            FinishReason::Other(s) => s,
        }
    }
}

/// Result of a completed inference call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceOutcome {
    pub finish_reason: FinishReason,
    pub content: String,
}

impl InferenceOutcome {
    pub fn stop(content: impl Into<String>) -> Self {
        Self {
            finish_reason: FinishReason::Stop,
            content: content.into(),
        }
    }
}

/// Trait for inference providers.
///
/// `Err` means the call itself failed (timeout, transport, provider error);
/// a call that returned but did not finish normally is an `Ok` outcome with
/// a non-stop finish reason.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutcome>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an inference backend based on configuration
pub fn create_backend(config: &InferenceConfig) -> Result<Arc<dyn InferenceBackend>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "inference.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAiBackend::new(
                key,
                Some(config.model.clone()),
                config.api_base.clone(),
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        "mock" => Ok(Arc::new(MockInferenceBackend::new())),
        other => Err(AppError::Configuration {
            message: format!("Unknown inference provider '{}'", other),
        }),
    }
}
