//! Read-through cache for directory metadata: users, groups, plans, buckets.
//!
//! Lookups hit Redis first (`meta/{kind}/{id}`, 24h TTL) and fall through to
//! the planner on a miss. Webhook notifications for directory changes
//! invalidate the affected entries.

use super::PlannerClient;
use crate::constants::METADATA_TTL_SECS;
use crate::token::OpClass;
use crate::redis::{keys, RedisClient};
use crate::Result;
use redis::AsyncCommands;
use tracing::debug;

#[derive(Clone)]
pub struct MetadataCache {
    redis: RedisClient,
    planner: PlannerClient,
}

impl MetadataCache {
    pub fn new(redis: RedisClient, planner: PlannerClient) -> Self {
        Self { redis, planner }
    }

    /// Fetch `kind`/`id` metadata through the cache. `fetch_path` is the
    /// planner path used on a miss.
    async fn read_through(
        &self,
        kind: &str,
        id: &str,
        fetch_path: &str,
        op_class: OpClass,
    ) -> Result<serde_json::Value> {
        let key = keys::metadata(kind, id);
        if let Some(cached) = self.redis.json_get::<serde_json::Value>(&key, "$").await? {
            return Ok(cached);
        }

        debug!("Metadata cache miss for {kind}/{id}");
        let value = self.planner.get_json(fetch_path, op_class).await?;
        self.store(&key, &value).await?;
        Ok(value)
    }

    async fn store(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.redis.json_set(key, "$", value).await?;
        let mut conn = self.redis.get_conn().await?;
        conn.expire::<_, ()>(key, METADATA_TTL_SECS as i64).await?;
        Ok(())
    }

    pub async fn user(&self, user_id: &str) -> Result<serde_json::Value> {
        self.read_through("user", user_id, &format!("/users/{user_id}"), OpClass::UserRead)
            .await
    }

    pub async fn group_plans(&self, group_id: &str) -> Result<serde_json::Value> {
        self.read_through(
            "group_plans",
            group_id,
            &format!("/groups/{group_id}/plans"),
            OpClass::TenantRead,
        )
        .await
    }

    pub async fn plan_buckets(&self, plan_id: &str) -> Result<serde_json::Value> {
        self.read_through(
            "plan_buckets",
            plan_id,
            &format!("/plans/{plan_id}/buckets"),
            OpClass::TaskGraph,
        )
        .await
    }

    /// Drop a cached entry; the next lookup re-fetches.
    pub async fn invalidate(&self, kind: &str, id: &str) -> Result<()> {
        let mut conn = self.redis.get_conn().await?;
        conn.del::<_, ()>(keys::metadata(kind, id)).await?;
        debug!("Invalidated metadata {kind}/{id}");
        Ok(())
    }

    /// Re-apply the 24h TTL to any metadata key that lost it. The
    /// housekeeper calls this each cycle; a TTL-less metadata key would
    /// otherwise serve stale directory data forever.
    pub async fn reapply_ttls(&self) -> Result<usize> {
        let mut conn = self.redis.get_conn().await?;
        let mut repaired = 0usize;
        let mut cursor: u64 = 0;
        let pattern = format!("{}*", keys::META_PREFIX);
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            for key in batch {
                let ttl: i64 = conn.ttl(&key).await?;
                if ttl < 0 {
                    conn.expire::<_, ()>(&key, METADATA_TTL_SECS as i64).await?;
                    repaired += 1;
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(repaired)
    }
}
