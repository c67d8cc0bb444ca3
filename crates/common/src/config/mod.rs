//! Configuration management for InfluenceMapper services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::Channel;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Topic names for jobs and replies
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Transport backend selection
    #[serde(default)]
    pub transport: TransportConfig,

    /// Inference provider configuration
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Reply collector configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Session registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Output bundle configuration
    #[serde(default)]
    pub bundle: BundleConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (not applied to progress streams)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelsConfig {
    /// Topic carrying author-class jobs
    #[serde(default = "default_author_topic")]
    pub author_jobs: String,

    /// Topic carrying study-class jobs
    #[serde(default = "default_study_topic")]
    pub study_jobs: String,

    /// Shared topic carrying every result envelope
    #[serde(default = "default_reply_topic")]
    pub replies: String,
}

impl ChannelsConfig {
    /// Job topic for a channel
    pub fn job_topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::Author => &self.author_jobs,
            Channel::Study => &self.study_jobs,
        }
    }
}

/// Transport backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Backend: redis or memory
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,

    /// Per-topic buffer for the in-process backend
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceConfig {
    /// Inference provider: openai, mock
    #[serde(default = "default_inference_provider")]
    pub provider: String,

    /// API key for the inference service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_inference_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient failures
    #[serde(default = "default_inference_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Job channels served by this process
    #[serde(default = "default_worker_channels")]
    pub channels: Vec<Channel>,

    /// Maximum in-flight jobs per channel
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    /// Seconds without a well-formed reply before a session is declared stalled
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Seconds an unclaimed mailbox is kept before it is pruned
    #[serde(default = "default_unclaimed_ttl")]
    pub unclaimed_ttl_secs: u64,
}

/// Session registry backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Backend: memory or redis
    #[serde(default = "default_registry_kind")]
    pub kind: RegistryKind,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL for session records in seconds (redis only)
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundleConfig {
    /// Directory completed bundles are written to
    #[serde(default = "default_bundle_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Upload requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_upload_bytes() -> usize { 10 * 1024 * 1024 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_author_topic() -> String { "author_channel".to_string() }
fn default_study_topic() -> String { "study_channel".to_string() }
fn default_reply_topic() -> String { "inference_results".to_string() }
fn default_transport_kind() -> TransportKind { TransportKind::Redis }
fn default_broadcast_capacity() -> usize { 1024 }
fn default_inference_provider() -> String { "openai".to_string() }
fn default_inference_model() -> String { "gpt-4o-mini".to_string() }
fn default_inference_timeout() -> u64 { 60 }
fn default_inference_retries() -> u32 { 3 }
fn default_worker_channels() -> Vec<Channel> { vec![Channel::Author, Channel::Study] }
fn default_max_concurrent_jobs() -> usize { 4 }
fn default_stall_timeout() -> u64 { 300 }
fn default_unclaimed_ttl() -> u64 { 900 }
fn default_registry_kind() -> RegistryKind { RegistryKind::Memory }
fn default_key_prefix() -> String { "influencemapper".to_string() }
fn default_session_ttl() -> u64 { 86_400 }
fn default_bundle_dir() -> String { "output".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "influencemapper".to_string() }
fn default_rate_limit() -> u32 { 5 }
fn default_burst() -> u32 { 10 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Idle period after which a collecting session is declared stalled
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.collector.stall_timeout_secs)
    }

    /// Lifetime of a mailbox nobody has claimed
    pub fn unclaimed_ttl(&self) -> Duration {
        Duration::from_secs(self.collector.unclaimed_ttl_secs)
    }

    /// Timeout for one inference call
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url() }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            author_jobs: default_author_topic(),
            study_jobs: default_study_topic(),
            replies: default_reply_topic(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: default_inference_provider(),
            api_key: None,
            api_base: None,
            model: default_inference_model(),
            timeout_secs: default_inference_timeout(),
            max_retries: default_inference_retries(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channels: default_worker_channels(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: default_stall_timeout(),
            unclaimed_ttl_secs: default_unclaimed_ttl(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: default_registry_kind(),
            key_prefix: default_key_prefix(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self { dir: default_bundle_dir() }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            channels: ChannelsConfig::default(),
            transport: TransportConfig::default(),
            inference: InferenceConfig::default(),
            worker: WorkerConfig::default(),
            collector: CollectorConfig::default(),
            registry: RegistryConfig::default(),
            bundle: BundleConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.channels.replies, "inference_results");
        assert_eq!(config.worker.channels, vec![Channel::Author, Channel::Study]);
    }

    #[test]
    fn test_job_topic_per_channel() {
        let channels = ChannelsConfig::default();
        assert_eq!(channels.job_topic(Channel::Author), "author_channel");
        assert_eq!(channels.job_topic(Channel::Study), "study_channel");
    }

    #[test]
    fn test_empty_source_falls_back_to_defaults() {
        let config: AppConfig = Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.collector.stall_timeout_secs, 300);
        assert_eq!(config.registry.kind, RegistryKind::Memory);
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.stall_timeout(), Duration::from_secs(300));
        assert_eq!(config.inference_timeout(), Duration::from_secs(60));
    }
}
