//! Bidirectional identity mappings and per-task sidecars.
//!
//! `map/agent->remote` and `map/remote->agent` are mutual inverses at all
//! times outside an in-flight operation. Binds write forward mapping, then
//! reverse mapping, then sidecars; a crash between steps leaves an asymmetry
//! the housekeeper repairs on its next pass.

use super::{keys, RedisClient};
use crate::constants::CACHED_REMOTE_TTL_SECS;
use crate::models::RemoteTask;
use crate::Result;
use chrono::Utc;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info};

/// Internal bookkeeping hash: remote_id → unix ts of last remote existence
/// confirmation. Drives the housekeeper's 24h verification scan.
const MAP_VERIFIED_AT: &str = "map/verified_at";

#[derive(Clone)]
pub struct MappingStore {
    client: RedisClient,
}

impl MappingStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Establish the agent_id ↔ remote_id association. Idempotent.
    pub async fn bind(&self, agent_id: &str, remote_id: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        // Write order matters for crash recovery: forward, then reverse,
        // then sidecars. The housekeeper restores the reverse entry from the
        // forward one if we die in between.
        conn.hset::<_, _, _, ()>(keys::MAP_AGENT_TO_REMOTE, agent_id, remote_id)
            .await?;
        conn.hset::<_, _, _, ()>(keys::MAP_REMOTE_TO_AGENT, remote_id, agent_id)
            .await?;
        conn.hset::<_, _, _, ()>(MAP_VERIFIED_AT, remote_id, Utc::now().timestamp())
            .await?;
        debug!("Bound mapping {agent_id} <-> {remote_id}");
        Ok(())
    }

    pub async fn resolve_remote(&self, agent_id: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_conn().await?;
        Ok(conn.hget(keys::MAP_AGENT_TO_REMOTE, agent_id).await?)
    }

    pub async fn resolve_agent(&self, remote_id: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_conn().await?;
        Ok(conn.hget(keys::MAP_REMOTE_TO_AGENT, remote_id).await?)
    }

    /// Tear down both directions and all sidecars, starting from the agent id.
    pub async fn unbind_by_agent(&self, agent_id: &str) -> Result<()> {
        let remote_id = self.resolve_remote(agent_id).await?;
        self.unbind(agent_id, remote_id.as_deref()).await
    }

    /// Tear down both directions and all sidecars, starting from the remote id.
    pub async fn unbind_by_remote(&self, remote_id: &str) -> Result<()> {
        let agent_id = self.resolve_agent(remote_id).await?;
        match agent_id {
            Some(agent_id) => self.unbind(&agent_id, Some(remote_id)).await,
            None => self.unbind("", Some(remote_id)).await,
        }
    }

    async fn unbind(&self, agent_id: &str, remote_id: Option<&str>) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        if !agent_id.is_empty() {
            conn.hdel::<_, _, ()>(keys::MAP_AGENT_TO_REMOTE, agent_id).await?;
            conn.del::<_, ()>(keys::last_upload(agent_id)).await?;
        }
        if let Some(remote_id) = remote_id {
            conn.hdel::<_, _, ()>(keys::MAP_REMOTE_TO_AGENT, remote_id).await?;
            conn.hdel::<_, _, ()>(MAP_VERIFIED_AT, remote_id).await?;
            conn.del::<_, ()>(keys::etag(remote_id)).await?;
            conn.del::<_, ()>(keys::cached_remote(remote_id)).await?;
        }
        info!(
            "Unbound mapping {} <-> {}",
            if agent_id.is_empty() { "?" } else { agent_id },
            remote_id.unwrap_or("?")
        );
        Ok(())
    }

    pub async fn forward_entries(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.client.get_conn().await?;
        Ok(conn.hgetall(keys::MAP_AGENT_TO_REMOTE).await?)
    }

    pub async fn reverse_entries(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.client.get_conn().await?;
        Ok(conn.hgetall(keys::MAP_REMOTE_TO_AGENT).await?)
    }

    /// Restore the reverse entry for a forward mapping observed without one
    /// (crash between bind steps). The inverse direction is handled by
    /// tearing the orphan down instead, since a reverse-only entry cannot
    /// tell us which side was authoritative.
    pub async fn repair_reverse(&self, agent_id: &str, remote_id: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        conn.hset::<_, _, _, ()>(keys::MAP_REMOTE_TO_AGENT, remote_id, agent_id)
            .await?;
        info!("Repaired reverse mapping {remote_id} -> {agent_id}");
        Ok(())
    }

    // ---- sidecars ----

    pub async fn etag(&self, remote_id: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_conn().await?;
        Ok(conn.get(keys::etag(remote_id)).await?)
    }

    pub async fn set_etag(&self, remote_id: &str, etag: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        conn.set::<_, _, ()>(keys::etag(remote_id), etag).await?;
        conn.hset::<_, _, _, ()>(MAP_VERIFIED_AT, remote_id, Utc::now().timestamp())
            .await?;
        Ok(())
    }

    pub async fn last_upload(&self, agent_id: &str) -> Result<Option<i64>> {
        let mut conn = self.client.get_conn().await?;
        let raw: Option<String> = conn.get(keys::last_upload(agent_id)).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    pub async fn set_last_upload(&self, agent_id: &str, unix_ts: i64) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        conn.set::<_, _, ()>(keys::last_upload(agent_id), unix_ts.to_string())
            .await?;
        Ok(())
    }

    /// Last fetched remote snapshot, used to suppress no-op echoes. 1h TTL.
    pub async fn cached_remote(&self, remote_id: &str) -> Result<Option<RemoteTask>> {
        self.client.json_get(&keys::cached_remote(remote_id), "$").await
    }

    pub async fn set_cached_remote(&self, remote_id: &str, task: &RemoteTask) -> Result<()> {
        let key = keys::cached_remote(remote_id);
        self.client.json_set(&key, "$", task).await?;
        let mut conn = self.client.get_conn().await?;
        conn.expire::<_, ()>(&key, CACHED_REMOTE_TTL_SECS as i64).await?;
        Ok(())
    }

    /// Remote ids whose last existence confirmation is older than `max_age_secs`.
    pub async fn stale_remote_ids(&self, max_age_secs: i64) -> Result<Vec<String>> {
        let mut conn = self.client.get_conn().await?;
        let verified: HashMap<String, i64> = conn.hgetall(MAP_VERIFIED_AT).await?;
        let cutoff = Utc::now().timestamp() - max_age_secs;

        let mut stale: Vec<String> = verified
            .into_iter()
            .filter(|(_, ts)| *ts < cutoff)
            .map(|(remote_id, _)| remote_id)
            .collect();

        // Mappings that predate verification tracking have no entry at all;
        // treat them as stale too.
        let reverse = self.reverse_entries().await?;
        for remote_id in reverse.keys() {
            let tracked: bool = conn.hexists(MAP_VERIFIED_AT, remote_id).await?;
            if !tracked {
                stale.push(remote_id.clone());
            }
        }
        Ok(stale)
    }

    pub async fn mark_verified(&self, remote_id: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        conn.hset::<_, _, _, ()>(MAP_VERIFIED_AT, remote_id, Utc::now().timestamp())
            .await?;
        Ok(())
    }
}
