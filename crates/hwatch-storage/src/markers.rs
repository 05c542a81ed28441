use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, IntoConnectionInfo};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key-value home of per-source markers. Values never expire.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, MarkerError>;
    async fn store(&self, key: &str, value: &str) -> Result<(), MarkerError>;
}

#[derive(Clone)]
pub struct RedisMarkerStore {
    conn: MultiplexedConnection,
}

impl RedisMarkerStore {
    pub async fn connect(info: impl IntoConnectionInfo) -> Result<Self, MarkerError> {
        let client = redis::Client::open(info)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn load(&self, key: &str) -> Result<Option<String>, MarkerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), MarkerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_value(self, key: &str, value: &str) -> Self {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn load(&self, key: &str) -> Result<Option<String>, MarkerError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), MarkerError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
