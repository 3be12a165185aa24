//! Operation queues and trimmed diagnostic logs.
//!
//! `pending_ops` is the ordered work queue the upload workers drain;
//! `failed_ops` holds operations that exhausted their retry budget, bounded
//! for operator inspection. `sync_log` and `webhook_log` are append-only
//! audit trails trimmed to a fixed length.

use super::{keys, RedisClient};
use crate::constants::LOG_TRIM_LENGTH;
use crate::models::{OperationDescriptor, SyncLogEntry};
use crate::Result;
use redis::AsyncCommands;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct OpQueue {
    client: RedisClient,
}

impl OpQueue {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Append an operation to the tail of `pending_ops`.
    pub async fn enqueue(&self, op: &OperationDescriptor) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        let json = serde_json::to_string(op)?;
        conn.rpush::<_, _, ()>(keys::PENDING_OPS, &json).await?;
        debug!(
            "Enqueued {:?} op for {} (attempt {})",
            op.kind, op.agent_id, op.attempt
        );
        Ok(())
    }

    /// Pop the head of `pending_ops`. Workers busy-wait on this with a short
    /// sleep; BLPOP would pin a pooled connection per worker.
    pub async fn dequeue(&self) -> Result<Option<OperationDescriptor>> {
        let mut conn = self.client.get_conn().await?;
        let raw: Option<String> = conn.lpop(keys::PENDING_OPS, None).await?;
        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(op) => Ok(Some(op)),
                Err(e) => {
                    // An undecodable descriptor is parked, not dropped.
                    warn!("Undecodable operation descriptor moved to failed_ops: {e}");
                    let mut conn = self.client.get_conn().await?;
                    conn.rpush::<_, _, ()>(keys::FAILED_OPS, &json).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.client.get_conn().await?;
        let len: usize = conn.llen(keys::PENDING_OPS).await?;
        Ok(len)
    }

    pub async fn failed_count(&self) -> Result<usize> {
        let mut conn = self.client.get_conn().await?;
        let len: usize = conn.llen(keys::FAILED_OPS).await?;
        Ok(len)
    }

    /// Park an operation that exceeded its retry budget or failed
    /// validation. Bounded like the logs so a poisoned stream cannot grow
    /// without limit.
    pub async fn park_failed(&self, op: &OperationDescriptor, reason: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        let record = serde_json::json!({
            "op": op,
            "reason": reason,
            "parked_at": chrono::Utc::now(),
        });
        conn.rpush::<_, _, ()>(keys::FAILED_OPS, serde_json::to_string(&record)?)
            .await?;
        conn.ltrim::<_, ()>(keys::FAILED_OPS, -LOG_TRIM_LENGTH, -1).await?;
        warn!(
            "Parked {:?} op for {} in failed_ops: {reason}",
            op.kind, op.agent_id
        );
        Ok(())
    }
}

/// Writer for the trimmed Redis audit logs.
#[derive(Clone)]
pub struct LogStore {
    client: RedisClient,
}

impl LogStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    pub async fn sync(&self, entry: SyncLogEntry) -> Result<()> {
        self.append(keys::SYNC_LOG, &serde_json::to_string(&entry)?).await
    }

    pub async fn webhook(&self, record: &serde_json::Value) -> Result<()> {
        self.append(keys::WEBHOOK_LOG, &serde_json::to_string(record)?).await
    }

    async fn append(&self, key: &str, json: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        conn.rpush::<_, _, ()>(key, json).await?;
        conn.ltrim::<_, ()>(key, -LOG_TRIM_LENGTH, -1).await?;
        Ok(())
    }

    /// Re-trim both logs; the housekeeper calls this each cycle in case an
    /// external writer appended without trimming.
    pub async fn trim_all(&self) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        conn.ltrim::<_, ()>(keys::SYNC_LOG, -LOG_TRIM_LENGTH, -1).await?;
        conn.ltrim::<_, ()>(keys::WEBHOOK_LOG, -LOG_TRIM_LENGTH, -1).await?;
        Ok(())
    }
}
