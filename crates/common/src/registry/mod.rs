//! Session registry
//!
//! Maps a session id to the number of replies its collector must see.
//! Records are written once, after emission settles, and never updated.

pub mod redis_store;

pub use redis_store::RedisSessionStore;

use crate::config::{AppConfig, RegistryKind};
use crate::errors::{AppError, Result};
use crate::models::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Immutable bookkeeping for one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub expected_total: u64,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, expected_total: u64) -> Self {
        Self {
            session_id,
            expected_total,
            created_at: Utc::now(),
        }
    }
}

/// Storage for session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a session. Fails with `SessionConflict` if the id exists.
    async fn create(&self, session_id: SessionId, expected_total: u64) -> Result<SessionRecord>;

    /// Look up a session record
    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>>;

    /// Expected reply count for a session
    async fn get_expected(&self, session_id: SessionId) -> Result<Option<u64>> {
        Ok(self.get(session_id).await?.map(|r| r.expected_total))
    }

    /// Check connectivity
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn conflict(session_id: SessionId) -> AppError {
    AppError::SessionConflict {
        id: session_id.to_string(),
        message: "session already registered".to_string(),
    }
}

/// Process-local registry
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session_id: SessionId, expected_total: u64) -> Result<SessionRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&session_id) {
            return Err(conflict(session_id));
        }
        let record = SessionRecord::new(session_id, expected_total);
        records.insert(session_id, record.clone());
        Ok(record)
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.records.read().await.get(&session_id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Create the registry selected by configuration
pub async fn create_session_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    match config.registry.kind {
        RegistryKind::Memory => {
            info!("Using in-process session registry");
            Ok(Arc::new(MemorySessionStore::new()))
        }
        RegistryKind::Redis => {
            info!(url = %config.redis.url, "Connecting session registry to Redis...");
            let store = RedisSessionStore::connect(
                &config.redis.url,
                config.registry.key_prefix.clone(),
                config.registry.session_ttl_secs,
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}
