use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::budget::GovernorSnapshot;
use crate::registry::BreakerSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Spend counters and circuit state that survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub governor: GovernorSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    pub saved_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<EngineState>, StoreError>;
    async fn save(&self, state: &EngineState) -> Result<(), StoreError>;
}

/// Keeps the whole state as one JSON document under a single key.
pub struct RedisStateStore {
    client: redis::Client,
    key: String,
}

impl RedisStateStore {
    pub fn new(redis_url: &str, key: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load(&self) -> Result<Option<EngineState>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(&self.key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &EngineState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(&self.key, json).await?;
        tracing::debug!("💾 Engine state saved to redis key {}", self.key);
        Ok(())
    }
}

/// Process-local store, used when no redis URL is configured.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<EngineState>, StoreError> {
        match self.state.lock().await.as_deref() {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &EngineState) -> Result<(), StoreError> {
        *self.state.lock().await = Some(serde_json::to_string(state)?);
        Ok(())
    }
}
