//! Health snapshot publication and housekeeping.
//!
//! The snapshot is written to the `health` key with a TTL equal to the
//! publication interval; external monitors read absence as a dead syncer.
//! The housekeeper runs on the same cadence and repairs the slow-moving
//! invariants: trimmed logs, verified mappings, mapping symmetry, and cache
//! TTLs.

use crate::constants::{HEALTH_INTERVAL_SECS, MAPPING_VERIFY_AGE_SECS};
use crate::graph::{MetadataCache, PlannerApi};
use crate::models::{SyncEvent, SyncLogEntry};
use crate::redis::{keys, LogStore, MappingStore, OpQueue, RedisClient};
use crate::subscriptions::FamilyTracker;
use crate::sync::TaskLocks;
use crate::token::TokenService;
use crate::webhook::{NotificationQueue, WebhookCounters};
use crate::Result;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Live flags the pipelines update and the reporter reads.
#[derive(Clone, Default)]
pub struct HealthState {
    degraded: Arc<AtomicBool>,
    last_successful_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn record_sync_success(&self) {
        *self.last_successful_sync.write().await = Some(Utc::now());
    }

    pub async fn last_successful_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_successful_sync.read().await
    }
}

#[derive(Debug, Serialize)]
struct HealthSnapshot {
    status: &'static str,
    at: DateTime<Utc>,
    pending_op_count: usize,
    failed_op_count: usize,
    last_successful_sync: Option<DateTime<Utc>>,
    subscriptions: serde_json::Value,
    token_ages: serde_json::Value,
    webhook_queue_len: usize,
    webhook_dropped: u64,
    webhook_rejected_client_state: u64,
}

/// Publishes the 5-minute health snapshot.
pub struct HealthReporter {
    redis: RedisClient,
    ops: OpQueue,
    tracker: FamilyTracker,
    tokens: TokenService,
    webhook_queue: NotificationQueue,
    webhook_counters: WebhookCounters,
    state: HealthState,
    ttl_secs: u64,
}

impl HealthReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: RedisClient,
        ops: OpQueue,
        tracker: FamilyTracker,
        tokens: TokenService,
        webhook_queue: NotificationQueue,
        webhook_counters: WebhookCounters,
        state: HealthState,
        ttl_secs: u64,
    ) -> Self {
        Self {
            redis,
            ops,
            tracker,
            tokens,
            webhook_queue,
            webhook_counters,
            state,
            ttl_secs,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Health reporter started ({}s interval)", HEALTH_INTERVAL_SECS);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEALTH_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.publish().await {
                        error!("Health snapshot publication failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Health reporter shutting down");
                    return;
                }
            }
        }
    }

    async fn publish(&self) -> Result<()> {
        let pending = self.ops.pending_count().await.unwrap_or(0);
        let failed = self.ops.failed_count().await.unwrap_or(0);

        let status = if self.state.is_degraded() {
            "degraded"
        } else {
            "healthy"
        };

        let snapshot = HealthSnapshot {
            status,
            at: Utc::now(),
            pending_op_count: pending,
            failed_op_count: failed,
            last_successful_sync: self.state.last_successful_sync().await,
            subscriptions: serde_json::to_value(self.tracker.snapshot().await)?,
            token_ages: serde_json::to_value(self.tokens.token_ages().await)?,
            webhook_queue_len: self.webhook_queue.len().await,
            webhook_dropped: self.webhook_queue.dropped_count(),
            webhook_rejected_client_state: self
                .webhook_counters
                .rejected_client_state
                .load(Ordering::Relaxed),
        };

        self.redis.json_set(keys::HEALTH, "$", &snapshot).await?;
        let mut conn = self.redis.get_conn().await?;
        conn.expire::<_, ()>(keys::HEALTH, self.ttl_secs as i64).await?;

        debug!("Published health snapshot ({status}, {pending} pending ops)");
        Ok(())
    }
}

/// Periodic repair of slow-moving invariants.
pub struct Housekeeper {
    mappings: MappingStore,
    planner: Arc<dyn PlannerApi>,
    metadata: MetadataCache,
    logs: LogStore,
    locks: TaskLocks,
}

impl Housekeeper {
    pub fn new(
        mappings: MappingStore,
        planner: Arc<dyn PlannerApi>,
        metadata: MetadataCache,
        logs: LogStore,
        locks: TaskLocks,
    ) -> Self {
        Self {
            mappings,
            planner,
            metadata,
            logs,
            locks,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Housekeeper started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEALTH_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick; startup reconciliation just ran.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!("Housekeeping cycle failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Housekeeper shutting down");
                    return;
                }
            }
        }
    }

    pub async fn cycle(&self) -> Result<()> {
        self.logs.trim_all().await?;
        self.repair_mapping_asymmetries().await?;
        self.verify_stale_mappings().await?;
        let repaired = self.metadata.reapply_ttls().await?;
        if repaired > 0 {
            info!("Re-applied TTL to {repaired} metadata keys");
        }
        let pruned = self.locks.prune().await;
        if pruned > 0 {
            debug!("Pruned {pruned} idle task locks");
        }
        Ok(())
    }

    /// A crash between bind steps leaves one direction written without the
    /// other. Forward-only entries are completed from the forward side if
    /// the remote still exists, torn down if it is gone; reverse-only
    /// entries are always torn down.
    async fn repair_mapping_asymmetries(&self) -> Result<()> {
        let forward = self.mappings.forward_entries().await?;
        let reverse = self.mappings.reverse_entries().await?;

        for (agent_id, remote_id) in &forward {
            if reverse.get(remote_id) == Some(agent_id) {
                continue;
            }
            warn!("Mapping asymmetry: {agent_id} -> {remote_id} has no reverse entry");
            match self.planner.task_exists(remote_id).await {
                Ok(true) => self.mappings.repair_reverse(agent_id, remote_id).await?,
                Ok(false) => {
                    self.mappings.unbind_by_agent(agent_id).await?;
                    self.log_teardown(agent_id, remote_id, "asymmetric bind, remote gone")
                        .await;
                }
                Err(e) => warn!("Could not verify {remote_id} during repair: {e}"),
            }
        }

        for (remote_id, agent_id) in &reverse {
            if forward.get(agent_id) == Some(remote_id) {
                continue;
            }
            warn!("Mapping asymmetry: reverse-only entry {remote_id} -> {agent_id}");
            self.mappings.unbind_by_remote(remote_id).await?;
            self.log_teardown(agent_id, remote_id, "reverse-only entry").await;
        }

        Ok(())
    }

    /// Mappings unverified for 24h get an existence probe; a 404 tears both
    /// directions down.
    async fn verify_stale_mappings(&self) -> Result<()> {
        let stale = self
            .mappings
            .stale_remote_ids(MAPPING_VERIFY_AGE_SECS)
            .await?;
        if stale.is_empty() {
            return Ok(());
        }

        debug!("Verifying {} stale mappings", stale.len());
        for remote_id in stale {
            match self.planner.task_exists(&remote_id).await {
                Ok(true) => self.mappings.mark_verified(&remote_id).await?,
                Ok(false) => {
                    let agent_id = self
                        .mappings
                        .resolve_agent(&remote_id)
                        .await?
                        .unwrap_or_default();
                    self.mappings.unbind_by_remote(&remote_id).await?;
                    self.log_teardown(&agent_id, &remote_id, "remote returned 404")
                        .await;
                }
                Err(e) => warn!("Existence probe for {remote_id} failed: {e}"),
            }
        }
        Ok(())
    }

    async fn log_teardown(&self, agent_id: &str, remote_id: &str, reason: &str) {
        let entry = SyncLogEntry::new(SyncEvent::MappingTornDown, reason)
            .agent(agent_id)
            .remote(remote_id);
        if let Err(e) = self.logs.sync(entry).await {
            warn!("Could not log mapping teardown: {e}");
        }
    }
}
