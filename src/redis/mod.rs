//! Redis integration for Spiral Bridge
//!
//! Redis is the only shared mutable store: the conscious-state documents,
//! identity mappings, operation queues, token slots, and diagnostic logs all
//! live here. Everything goes through one connection pool; the pub/sub
//! listener holds its own dedicated connection.

use crate::{config::RedisConfig, Result};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

pub mod mapping;
pub mod pubsub;
pub mod queues;
pub mod state;

pub use mapping::MappingStore;
pub use pubsub::{ChangeSignal, PubSubHandle};
pub use queues::{LogStore, OpQueue};
pub use state::StateStore;

/// Redis key namespace. Names are stable contracts with upstream agent code.
pub mod keys {
    pub const STATE_GLOBAL: &str = "agent_state/global";
    pub const STATE_CONV_PREFIX: &str = "agent_state/conv/";
    pub const TASK_PREFIX: &str = "tasks/";
    pub const MAP_AGENT_TO_REMOTE: &str = "map/agent->remote";
    pub const MAP_REMOTE_TO_AGENT: &str = "map/remote->agent";
    pub const ETAG_PREFIX: &str = "etag/";
    pub const LAST_UPLOAD_PREFIX: &str = "last_upload/";
    pub const CACHED_REMOTE_PREFIX: &str = "cached_remote/";
    pub const PENDING_OPS: &str = "pending_ops";
    pub const FAILED_OPS: &str = "failed_ops";
    pub const SYNC_LOG: &str = "sync_log";
    pub const WEBHOOK_LOG: &str = "webhook_log";
    pub const HEALTH: &str = "health";
    pub const TOKEN_PREFIX: &str = "token/";
    pub const SUB_PREFIX: &str = "sub/";
    pub const META_PREFIX: &str = "meta/";

    pub const CHANNEL_TASK_UPDATES: &str = "tasks/updates";
    pub const CHANNEL_TASK_SYNC: &str = "tasks/sync";

    pub fn conv_state(conversation_id: &str) -> String {
        format!("{STATE_CONV_PREFIX}{conversation_id}")
    }

    pub fn task(agent_id: &str) -> String {
        format!("{TASK_PREFIX}{agent_id}")
    }

    pub fn etag(remote_id: &str) -> String {
        format!("{ETAG_PREFIX}{remote_id}")
    }

    pub fn last_upload(agent_id: &str) -> String {
        format!("{LAST_UPLOAD_PREFIX}{agent_id}")
    }

    pub fn cached_remote(remote_id: &str) -> String {
        format!("{CACHED_REMOTE_PREFIX}{remote_id}")
    }

    pub fn token(kind: &str) -> String {
        format!("{TOKEN_PREFIX}{kind}")
    }

    pub fn subscription(family: &str) -> String {
        format!("{SUB_PREFIX}{family}")
    }

    pub fn metadata(kind: &str, id: &str) -> String {
        format!("{META_PREFIX}{kind}/{id}")
    }
}

/// Pooled Redis client shared by every component.
#[derive(Clone)]
pub struct RedisClient {
    pool: Pool,
    config: RedisConfig,
}

impl RedisClient {
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        info!("Connecting to Redis at {}", config.url);

        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| anyhow::anyhow!("Failed to create Redis pool builder: {e}"))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create Redis pool: {e}"))?;

        // Test connection before handing the pool out
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(
            "Redis connection established (pool size: {})",
            config.pool_size
        );

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    pub async fn get_conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Enable keyspace notifications for generic + string events.
    ///
    /// Best effort: managed Redis deployments often forbid CONFIG SET and
    /// configure this server-side; the drift timer covers the gap if neither
    /// is the case.
    pub async fn enable_keyspace_events(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let result: std::result::Result<String, redis::RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("K$gA")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => debug!("Keyspace notifications enabled"),
            Err(e) => debug!("Could not enable keyspace notifications: {e}"),
        }
        Ok(())
    }

    /// `JSON.GET key path` deserialized into `T`. RedisJSON wraps path
    /// results in an array; a missing path yields `None`.
    pub async fn json_get<T: DeserializeOwned>(&self, key: &str, path: &str) -> Result<Option<T>> {
        let mut conn = self.get_conn().await?;
        let raw: Option<String> = redis::cmd("JSON.GET")
            .arg(key)
            .arg(path)
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else { return Ok(None) };

        // `$`-style paths return a JSON array of matches.
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let inner = if path.starts_with('$') {
            match value {
                serde_json::Value::Array(mut items) if !items.is_empty() => items.remove(0),
                _ => return Ok(None),
            }
        } else {
            value
        };

        Ok(Some(serde_json::from_value(inner)?))
    }

    /// `JSON.SET key path value`, field-scoped so concurrent writers editing
    /// disjoint sub-paths do not conflict.
    pub async fn json_set<T: Serialize>(&self, key: &str, path: &str, value: &T) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let json = serde_json::to_string(value)?;
        redis::cmd("JSON.SET")
            .arg(key)
            .arg(path)
            .arg(&json)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// `JSON.DEL key path`; returns how many paths were removed.
    pub async fn json_del(&self, key: &str, path: &str) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let removed: i64 = redis::cmd("JSON.DEL")
            .arg(key)
            .arg(path)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    /// `JSON.ARRAPPEND key path value`.
    pub async fn json_arr_append<T: Serialize>(
        &self,
        key: &str,
        path: &str,
        value: &T,
    ) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let json = serde_json::to_string(value)?;
        redis::cmd("JSON.ARRAPPEND")
            .arg(key)
            .arg(path)
            .arg(&json)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespace_is_stable() {
        // These names are contracts with upstream agent code; a rename here
        // silently orphans live data.
        assert_eq!(keys::STATE_GLOBAL, "agent_state/global");
        assert_eq!(keys::conv_state("c1"), "agent_state/conv/c1");
        assert_eq!(keys::task("t1"), "tasks/t1");
        assert_eq!(keys::etag("R1"), "etag/R1");
        assert_eq!(keys::last_upload("t1"), "last_upload/t1");
        assert_eq!(keys::cached_remote("R1"), "cached_remote/R1");
        assert_eq!(keys::token("delegated"), "token/delegated");
        assert_eq!(keys::subscription("chats"), "sub/chats");
        assert_eq!(keys::metadata("user", "u1"), "meta/user/u1");
    }
}
