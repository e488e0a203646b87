use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{DeliveryState, NotificationRecord};

/// Errors that can occur with the notification record store
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Durable home of notification records
///
/// A record is written as Pending before the first delivery attempt, moved
/// to Delivered on success, or parked in the dead-letter set on exhaustion.
/// Delivered keys stay queryable so a crash-restart never re-observes a
/// completed delivery as pending work.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_pending(&self, record: &NotificationRecord) -> Result<(), RecordStoreError>;
    async fn mark_delivered(&self, record: &NotificationRecord) -> Result<(), RecordStoreError>;
    async fn mark_failed(&self, record: &NotificationRecord) -> Result<(), RecordStoreError>;
    async fn is_delivered(&self, idempotency_key: &str) -> Result<bool, RecordStoreError>;
    /// Pending records surviving a restart, for delivery resumption
    async fn load_pending(&self) -> Result<Vec<NotificationRecord>, RecordStoreError>;
    /// Dead-lettered records retained for manual replay
    async fn load_failed(&self) -> Result<Vec<NotificationRecord>, RecordStoreError>;
}

/// Record key builder
pub struct RecordKey;

impl RecordKey {
    pub fn pending(key: &str) -> String {
        format!("notify:pending:{}", key)
    }

    pub fn delivered(key: &str) -> String {
        format!("notify:delivered:{}", key)
    }

    pub fn failed(key: &str) -> String {
        format!("notify:dlq:{}", key)
    }
}

/// Redis-backed record store with an L1 cache of delivered keys
pub struct RedisRecordStore {
    // Store ConnectionManager in a Mutex for interior mutability
    redis: Arc<tokio::sync::Mutex<ConnectionManager>>,
    delivered_l1: moka::future::Cache<String, ()>,
    delivered_ttl_secs: u64,
}

impl RedisRecordStore {
    pub async fn new(
        redis_url: &str,
        l1_size: u64,
        delivered_ttl_secs: u64,
    ) -> Result<Self, RecordStoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        let delivered_l1 = moka::future::CacheBuilder::new(l1_size)
            .time_to_live(Duration::from_secs(delivered_ttl_secs))
            .build();

        Ok(Self {
            redis: Arc::new(tokio::sync::Mutex::new(redis)),
            delivered_l1,
            delivered_ttl_secs,
        })
    }

    async fn load_set(&self, pattern: &str) -> Result<Vec<NotificationRecord>, RecordStoreError> {
        let mut conn = self.redis.lock().await;
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut *conn).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let json: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut *conn).await?;
            if let Some(json) = json {
                records.push(serde_json::from_str(&json)?);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn put_pending(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.redis.lock().await;
        redis::cmd("SET")
            .arg(RecordKey::pending(&record.idempotency_key))
            .arg(json)
            .query_async::<()>(&mut *conn)
            .await?;
        tracing::trace!("Record pending: {}", record.idempotency_key);
        Ok(())
    }

    async fn mark_delivered(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("DEL")
            .arg(RecordKey::pending(&record.idempotency_key))
            .query_async::<()>(&mut *conn)
            .await?;
        redis::cmd("SETEX")
            .arg(RecordKey::delivered(&record.idempotency_key))
            .arg(self.delivered_ttl_secs)
            .arg(record.attempts)
            .query_async::<()>(&mut *conn)
            .await?;
        drop(conn);

        self.delivered_l1
            .insert(record.idempotency_key.clone(), ())
            .await;
        Ok(())
    }

    async fn mark_failed(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
        // Dead-letter entries have no TTL: kept until an operator replays or
        // purges them.
        let json = serde_json::to_string(record)?;
        let mut conn = self.redis.lock().await;
        redis::cmd("DEL")
            .arg(RecordKey::pending(&record.idempotency_key))
            .query_async::<()>(&mut *conn)
            .await?;
        redis::cmd("SET")
            .arg(RecordKey::failed(&record.idempotency_key))
            .arg(json)
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn is_delivered(&self, idempotency_key: &str) -> Result<bool, RecordStoreError> {
        if self.delivered_l1.get(idempotency_key).await.is_some() {
            return Ok(true);
        }

        let mut conn = self.redis.lock().await;
        let exists: bool = redis::cmd("EXISTS")
            .arg(RecordKey::delivered(idempotency_key))
            .query_async(&mut *conn)
            .await?;
        drop(conn);

        if exists {
            self.delivered_l1.insert(idempotency_key.to_string(), ()).await;
        }
        Ok(exists)
    }

    async fn load_pending(&self) -> Result<Vec<NotificationRecord>, RecordStoreError> {
        self.load_set("notify:pending:*").await
    }

    async fn load_failed(&self) -> Result<Vec<NotificationRecord>, RecordStoreError> {
        self.load_set("notify:dlq:*").await
    }
}

/// In-memory store used by tests and local development without Redis
#[derive(Default)]
pub struct MemoryRecordStore {
    pending: DashMap<String, NotificationRecord>,
    delivered: DashMap<String, u32>,
    failed: DashMap<String, NotificationRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_pending(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
        self.pending
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn mark_delivered(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
        self.pending.remove(&record.idempotency_key);
        self.delivered
            .insert(record.idempotency_key.clone(), record.attempts);
        Ok(())
    }

    async fn mark_failed(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
        self.pending.remove(&record.idempotency_key);
        let mut failed = record.clone();
        failed.delivery_state = DeliveryState::Failed;
        self.failed.insert(record.idempotency_key.clone(), failed);
        Ok(())
    }

    async fn is_delivered(&self, idempotency_key: &str) -> Result<bool, RecordStoreError> {
        Ok(self.delivered.contains_key(idempotency_key))
    }

    async fn load_pending(&self) -> Result<Vec<NotificationRecord>, RecordStoreError> {
        Ok(self.pending.iter().map(|e| e.value().clone()).collect())
    }

    async fn load_failed(&self) -> Result<Vec<NotificationRecord>, RecordStoreError> {
        Ok(self.failed.iter().map(|e| e.value().clone()).collect())
    }
}
