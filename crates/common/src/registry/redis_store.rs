//! Redis-backed session registry
//!
//! Records are written with `SET NX`, so a session id can be registered
//! exactly once even when several gateway replicas share one Redis.

use super::{conflict, SessionRecord, SessionStore};
use crate::errors::{AppError, Result};
use crate::models::SessionId;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::debug;

/// Redis session registry client
pub struct RedisSessionStore {
    connection: ConnectionManager,
    key_prefix: String,
    ttl_secs: u64,
}

impl RedisSessionStore {
    /// Create a new registry client
    pub async fn connect(url: &str, key_prefix: String, ttl_secs: u64) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::Registry {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Registry {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            connection,
            key_prefix,
            ttl_secs,
        })
    }

    /// Build a prefixed key
    fn key(&self, session_id: SessionId) -> String {
        session_key(&self.key_prefix, session_id)
    }
}

fn session_key(prefix: &str, session_id: SessionId) -> String {
    format!("{}:session:{}", prefix, session_id)
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session_id: SessionId, expected_total: u64) -> Result<SessionRecord> {
        let key = self.key(session_id);
        let record = SessionRecord::new(session_id, expected_total);
        let json = serde_json::to_string(&record)?;

        let mut conn = self.connection.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Registry {
                message: format!("Failed to set key '{}': {}", key, e),
            })?;

        match set {
            Some(_) => {
                debug!(key = %key, expected_total, "Session registered");
                Ok(record)
            }
            None => Err(conflict(session_id)),
        }
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        let key = self.key(session_id);
        let mut conn = self.connection.clone();

        let value: Option<String> = conn.get(&key).await.map_err(|e| AppError::Registry {
            message: format!("Failed to get key '{}': {}", key, e),
        })?;

        match value {
            Some(json) => {
                let record = serde_json::from_str(&json).map_err(|e| AppError::Registry {
                    message: format!("Failed to parse session record: {}", e),
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::Registry {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builder() {
        let id = SessionId::new();
        let key = session_key("influencemapper", id);
        assert!(key.starts_with("influencemapper:session:"));
        assert!(key.ends_with(&id.to_string()));
    }
}
