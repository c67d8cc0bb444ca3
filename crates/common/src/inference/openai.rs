//! OpenAI-compatible chat completions client

use super::{FinishReason, InferenceBackend, InferenceOutcome, InferenceRequest};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat completions client with JSON-object response format
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    finish_reason: Option<String>,
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiBackend {
    /// Create a new client
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            timeout,
        })
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutcome> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
            response_format: ResponseFormat { kind: "json_object" },
            temperature: 0.0,
        };

        let response = self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::InferenceTimeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    AppError::Inference {
                        message: format!("Request failed: {}", e),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Inference {
                message: format!("API error {}: {}", status, body),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| AppError::Inference {
            message: format!("Failed to parse response: {}", e),
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| AppError::Inference {
            message: "Response contained no choices".to_string(),
        })?;

        Ok(InferenceOutcome {
            finish_reason: choice
                .finish_reason
                .map(FinishReason::from)
                .unwrap_or_else(|| FinishReason::Other("missing".to_string())),
            content: choice.message.content.unwrap_or_default(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;

    #[test]
    fn test_request_body_shape() {
        let request = InferenceRequest {
            channel: Channel::Study,
            system: "sys".into(),
            user: "usr".into(),
        };
        let body = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
            response_format: ResponseFormat { kind: "json_object" },
            temperature: 0.0,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][1]["content"], "usr");
    }

    #[test]
    fn test_refusal_response_decodes() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"finish_reason":"content_filter","message":{"content":null}}]}"#,
        )
        .unwrap();
        let choice = &response.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("content_filter"));
        assert!(choice.message.content.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let backend = OpenAiBackend::new(
            "key".into(),
            None,
            Some("http://127.0.0.1:9".into()),
            Duration::from_millis(200),
        )
        .unwrap();
        let request = InferenceRequest {
            channel: Channel::Study,
            system: String::new(),
            user: String::new(),
        };
        assert!(backend.infer(&request).await.is_err());
    }
}
