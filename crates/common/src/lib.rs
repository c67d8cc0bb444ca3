//! InfluenceMapper Common Library
//!
//! Shared code for the gateway and the inference worker including:
//! - Job and result envelopes with session binding
//! - Pub/sub transport abstraction (Redis, in-process)
//! - Inference backend abstraction and prompts
//! - Job emitter, inference worker, reply router and collector
//! - Session registry
//! - Normalization into relational tables and bundle packaging
//! - Error types, configuration, metrics

pub mod bundle;
pub mod collector;
pub mod config;
pub mod emitter;
pub mod errors;
pub mod inference;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod registry;
pub mod tabular;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use errors::{AppError, Result};
pub use config::AppConfig;
pub use models::{Channel, JobEnvelope, JobPayload, ResultEnvelope, SessionId};
pub use transport::Transport;
pub use inference::InferenceBackend;
pub use registry::SessionStore;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error text carried by a reply whose inference did not complete normally
pub const NOT_FINISHED_ERROR: &str = "Inference did not finish. Try again later.";

/// Error text carried by a reply whose content could not be parsed
pub const MALFORMED_CONTENT_ERROR: &str = "Inference returned malformed content.";
