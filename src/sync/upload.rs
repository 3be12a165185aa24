//! Upload pipeline: agent-side mutations out to the planner.
//!
//! Change signals (keyspace notifications, agent announcements) schedule a
//! debounced diff; a 30-second drift timer catches anything the signals
//! missed. The diff's edit set is enqueued as operation descriptors, and a
//! fixed worker pool drains them under per-task locks, so at most one HTTP
//! operation is ever in flight per task.

use crate::adapter;
use crate::config::SyncConfig;
use crate::constants::{
    BACKOFF_CAP_SECS, DEBOUNCE_MAX_MS, DEBOUNCE_MIN_MS, DRIFT_INTERVAL_SECS, MAX_OP_ATTEMPTS,
    PENDING_OPS_SOFT_LIMIT,
};
use crate::graph::PlannerApi;
use crate::health::HealthState;
use crate::models::{
    AgentTask, OpKind, OperationDescriptor, SyncEvent, SyncLogEntry,
};
use crate::redis::pubsub::SyncConfirmation;
use crate::redis::{LogStore, MappingStore, OpQueue, PubSubHandle, StateStore};
use crate::sync::diff::{self, DeleteDetector, DiffInputs};
use crate::sync::TaskLocks;
use crate::{BridgeError, Result};
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Label prefixes agents may use to steer where a create lands.
const PLAN_HINT_PREFIX: &str = "plan:";
const BUCKET_HINT_PREFIX: &str = "bucket:";

pub struct UploadPipeline {
    config: SyncConfig,
    state: StateStore,
    mappings: MappingStore,
    ops: OpQueue,
    logs: LogStore,
    planner: Arc<dyn PlannerApi>,
    pubsub: PubSubHandle,
    locks: TaskLocks,
    health: HealthState,
    delete_detector: Mutex<DeleteDetector>,
    /// (agent_id, kind) pairs already waiting in pending_ops; diff passes
    /// fold rather than double-enqueue.
    queued: Mutex<HashSet<(String, OpKind)>>,
}

impl UploadPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        state: StateStore,
        mappings: MappingStore,
        ops: OpQueue,
        logs: LogStore,
        planner: Arc<dyn PlannerApi>,
        pubsub: PubSubHandle,
        locks: TaskLocks,
        health: HealthState,
    ) -> Self {
        Self {
            config,
            state,
            mappings,
            ops,
            logs,
            planner,
            pubsub,
            locks,
            health,
            delete_detector: Mutex::new(DeleteDetector::new()),
            queued: Mutex::new(HashSet::new()),
        }
    }

    /// Start every loop of the pipeline and block until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            "Upload pipeline started ({} workers)",
            self.config.upload_workers
        );

        let mut handles = Vec::new();

        let signal = self.clone();
        let signal_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            signal.signal_loop(signal_shutdown).await;
        }));

        let drift = self.clone();
        let drift_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            drift.drift_loop(drift_shutdown).await;
        }));

        for worker_id in 0..self.config.upload_workers {
            let worker = self.clone();
            let worker_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.worker_loop(worker_id, worker_shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("Upload pipeline stopped");
    }

    /// One full diff pass, also used for startup reconciliation.
    pub async fn reconcile_once(&self) -> Result<()> {
        self.run_diff().await
    }

    // ---- trigger surfaces ----

    async fn signal_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.pubsub.subscribe();
        loop {
            // Wait for the first unserviced signal.
            tokio::select! {
                signal = rx.recv() => match signal {
                    Ok(signal) => debug!("Change signal: {signal:?}"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Change signal stream lagged by {n}; diffing anyway");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.changed() => return,
            }

            // Debounce: no sooner than 500ms after this signal, no later
            // than 2s after it; further signals inside the window fold.
            let first = Instant::now();
            let ceiling = first + Duration::from_millis(DEBOUNCE_MAX_MS);
            let mut deadline = first + Duration::from_millis(DEBOUNCE_MIN_MS);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    signal = rx.recv() => {
                        if signal.is_ok() {
                            deadline =
                                (Instant::now() + Duration::from_millis(DEBOUNCE_MIN_MS))
                                    .min(ceiling);
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }

            if let Err(e) = self.run_diff().await {
                error!("Signal-driven diff failed: {e}");
            }
        }
    }

    async fn drift_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(DRIFT_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }

            // Back-pressure: a saturated queue means the drift pass would
            // only pile on; skip the tick and surface it.
            match self.ops.pending_count().await {
                Ok(pending) if pending > PENDING_OPS_SOFT_LIMIT => {
                    warn!("pending_ops at {pending}; skipping drift tick");
                    self.health.set_degraded(true);
                    continue;
                }
                Ok(_) => self.health.set_degraded(false),
                Err(e) => {
                    warn!("Could not read pending_ops depth: {e}");
                    continue;
                }
            }

            if let Err(e) = self.run_diff().await {
                error!("Drift diff failed: {e}");
            }
        }
    }

    // ---- diffing ----

    async fn run_diff(&self) -> Result<()> {
        let universe: Vec<AgentTask> = self
            .state
            .all_tasks()
            .await?
            .into_iter()
            .map(|(_, task)| task)
            .collect();

        let forward = self.mappings.forward_entries().await?;

        let mut last_uploads = HashMap::new();
        let mut baselines = HashMap::new();
        for task in &universe {
            let Some(remote_id) = forward.get(&task.id) else { continue };
            if let Some(ts) = self.mappings.last_upload(&task.id).await? {
                last_uploads.insert(task.id.clone(), ts);
            }
            if let Some(cached) = self.mappings.cached_remote(remote_id).await? {
                // Translate the last-synced remote snapshot back into agent
                // shape against the current task, so agent-owned fields
                // never register as changes.
                let baseline = adapter::to_agent(&cached, Some(task), &self.config.user_id_map);
                baselines.insert(task.id.clone(), baseline);
            }
        }

        let inputs = DiffInputs {
            mappings: forward.clone(),
            last_uploads,
            baselines,
        };
        let edits = diff::compute_edits(&universe, &inputs);

        let missing = diff::missing_mapped_ids(&universe, &forward);
        let confirmed_deletes = {
            let mut detector = self.delete_detector.lock().await;
            detector.observe(&missing, Duration::from_secs(DRIFT_INTERVAL_SECS))
        };

        if edits.is_empty() && confirmed_deletes.is_empty() {
            return Ok(());
        }
        debug!(
            "Diff: {} creates, {} updates, {} deletes",
            edits.creates.len(),
            edits.updates.len(),
            confirmed_deletes.len()
        );

        for task in edits.creates {
            let op = OperationDescriptor::new(OpKind::Create, &task.id, task.priority);
            self.enqueue_folded(op).await?;
        }

        for (task, fields) in edits.updates {
            let mut field_map = serde_json::Map::new();
            for field in fields {
                field_map.insert(field, serde_json::Value::Bool(true));
            }
            let remote_id = forward.get(&task.id).cloned().unwrap_or_default();
            let op = OperationDescriptor::new(OpKind::Update, &task.id, task.priority)
                .with_remote_id(remote_id)
                .with_fields(field_map);
            self.enqueue_folded(op).await?;
        }

        for agent_id in confirmed_deletes {
            let Some(remote_id) = forward.get(&agent_id) else { continue };
            let op = OperationDescriptor::new(
                OpKind::Delete,
                &agent_id,
                crate::models::TaskPriority::Normal,
            )
            .with_remote_id(remote_id.clone());
            self.enqueue_folded(op).await?;
        }

        Ok(())
    }

    /// Enqueue unless an identical (task, kind) op is already pending; the
    /// waiting op executes against latest state anyway, and its original
    /// enqueue timestamp keeps its place in line.
    async fn enqueue_folded(&self, op: OperationDescriptor) -> Result<()> {
        let key = (op.agent_id.clone(), op.kind);
        {
            let mut queued = self.queued.lock().await;
            if !queued.insert(key) {
                debug!("Folded duplicate {:?} op for {}", op.kind, op.agent_id);
                return Ok(());
            }
        }
        self.ops.enqueue(&op).await
    }

    // ---- workers ----

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("Upload worker {worker_id} started");
        loop {
            if *shutdown.borrow() {
                return;
            }

            let op = match self.ops.dequeue().await {
                Ok(Some(op)) => op,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
                Err(e) => {
                    warn!("Worker {worker_id} could not dequeue: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            {
                let mut queued = self.queued.lock().await;
                queued.remove(&(op.agent_id.clone(), op.kind));
            }

            // A failing operation never takes the worker down with it.
            if let Err(e) = self.execute(op).await {
                warn!("Worker {worker_id}: operation failed: {e}");
            }
        }
    }

    async fn execute(&self, op: OperationDescriptor) -> Result<()> {
        let _guard = self.locks.acquire_agent(&op.agent_id).await;
        match op.kind {
            OpKind::Create => self.execute_create(op).await,
            OpKind::Update => self.execute_update(op).await,
            OpKind::Delete => self.execute_delete(op).await,
        }
    }

    async fn execute_create(&self, op: OperationDescriptor) -> Result<()> {
        // The download pipeline may have bound this task since the diff ran.
        if self.mappings.resolve_remote(&op.agent_id).await?.is_some() {
            debug!("Create for {} superseded by existing mapping", op.agent_id);
            return Ok(());
        }
        let Some((_, task)) = self.state.find_task(&op.agent_id).await? else {
            debug!("Create for {} dropped; task no longer present", op.agent_id);
            return Ok(());
        };

        let plan_id = label_hint(&task, PLAN_HINT_PREFIX)
            .unwrap_or_else(|| self.config.default_plan_id.clone());
        let bucket_id = match label_hint(&task, BUCKET_HINT_PREFIX) {
            Some(bucket) => bucket,
            None => self.first_bucket(&plan_id).await.unwrap_or_default(),
        };

        let remote =
            match adapter::to_remote(&task, &plan_id, &bucket_id, &self.config.user_id_map) {
                Ok(remote) => remote,
                Err(e) => {
                    self.ops.park_failed(&op, &e.to_string()).await?;
                    return Ok(());
                }
            };

        match self.planner.create_task(&remote).await {
            Ok(fetch) => {
                self.mappings.bind(&op.agent_id, &fetch.task.id).await?;
                self.mappings.set_etag(&fetch.task.id, &fetch.etag).await?;
                self.mappings.set_cached_remote(&fetch.task.id, &fetch.task).await?;
                self.mappings
                    .set_last_upload(&op.agent_id, Utc::now().timestamp())
                    .await?;
                self.health.record_sync_success().await;

                let _ = self
                    .pubsub
                    .publish_sync_confirmation(&SyncConfirmation::Uploaded {
                        agent_id: op.agent_id.clone(),
                        remote_id: fetch.task.id.clone(),
                    })
                    .await;
                self.logs
                    .sync(
                        SyncLogEntry::new(SyncEvent::Created, "created on planner")
                            .agent(&op.agent_id)
                            .remote(&fetch.task.id),
                    )
                    .await?;
                info!("Created remote task {} for {}", fetch.task.id, op.agent_id);
                Ok(())
            }
            Err(e) => self.handle_failure(op, e).await,
        }
    }

    async fn execute_update(&self, op: OperationDescriptor) -> Result<()> {
        let Some(remote_id) = self.resolve_remote(&op).await? else {
            debug!("Update for {} dropped; mapping gone", op.agent_id);
            return Ok(());
        };
        let Some((_, task)) = self.state.find_task(&op.agent_id).await? else {
            debug!("Update for {} dropped; task no longer present", op.agent_id);
            return Ok(());
        };

        let fields: Vec<String> = op
            .fields
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let patch = adapter::remote_patch_for_fields(&task, &fields, &self.config.user_id_map);
        if patch.is_empty() {
            self.mappings
                .set_last_upload(&op.agent_id, Utc::now().timestamp())
                .await?;
            return Ok(());
        }

        let etag = match self.current_etag(&remote_id).await? {
            Some(etag) => etag,
            None => {
                // Etag gone (or never observed); 404 here is the remote
                // telling us the task no longer exists.
                match self.planner.get_task(&remote_id).await {
                    Ok(fetch) => {
                        self.mappings.set_etag(&remote_id, &fetch.etag).await?;
                        self.mappings.set_cached_remote(&remote_id, &fetch.task).await?;
                        fetch.etag
                    }
                    Err(BridgeError::RemoteNotFound(_)) => {
                        return self.teardown(&op, &remote_id, "update target gone").await;
                    }
                    Err(e) => return self.handle_failure(op, e).await,
                }
            }
        };

        match self.planner.patch_task(&remote_id, &etag, &patch).await {
            Ok(fetch) => self.commit_update(&op, &remote_id, fetch).await,
            Err(BridgeError::PreconditionFailed { .. }) => {
                // Rebase once on a fresh read, then retry. A second 412
                // demotes to the conflict resolver with the fresh snapshot
                // already stored.
                debug!("412 on {remote_id}; rebasing");
                let fresh = match self.planner.get_task(&remote_id).await {
                    Ok(fresh) => fresh,
                    Err(BridgeError::RemoteNotFound(_)) => {
                        return self.teardown(&op, &remote_id, "update target gone").await;
                    }
                    Err(e) => return self.handle_failure(op, e).await,
                };
                self.mappings.set_etag(&remote_id, &fresh.etag).await?;
                self.mappings.set_cached_remote(&remote_id, &fresh.task).await?;

                match self.planner.patch_task(&remote_id, &fresh.etag, &patch).await {
                    Ok(fetch) => self.commit_update(&op, &remote_id, fetch).await,
                    Err(BridgeError::PreconditionFailed { .. }) => {
                        self.logs
                            .sync(
                                SyncLogEntry::new(
                                    SyncEvent::DemotedToConflict,
                                    "second 412 after rebase",
                                )
                                .agent(&op.agent_id)
                                .remote(&remote_id),
                            )
                            .await?;
                        warn!("Update for {} demoted to conflict resolver", op.agent_id);
                        Ok(())
                    }
                    Err(e) => self.handle_failure(op, e).await,
                }
            }
            Err(BridgeError::RemoteNotFound(_)) => {
                self.teardown(&op, &remote_id, "update target gone").await
            }
            Err(e) => self.handle_failure(op, e).await,
        }
    }

    async fn commit_update(
        &self,
        op: &OperationDescriptor,
        remote_id: &str,
        fetch: crate::graph::TaskFetch,
    ) -> Result<()> {
        self.mappings.set_etag(remote_id, &fetch.etag).await?;
        self.mappings.set_cached_remote(remote_id, &fetch.task).await?;
        self.mappings
            .set_last_upload(&op.agent_id, Utc::now().timestamp())
            .await?;
        self.health.record_sync_success().await;

        let _ = self
            .pubsub
            .publish_sync_confirmation(&SyncConfirmation::Uploaded {
                agent_id: op.agent_id.clone(),
                remote_id: remote_id.to_string(),
            })
            .await;
        self.logs
            .sync(
                SyncLogEntry::new(SyncEvent::Updated, "patched on planner")
                    .agent(&op.agent_id)
                    .remote(remote_id),
            )
            .await?;
        debug!("Patched remote task {remote_id} for {}", op.agent_id);
        Ok(())
    }

    async fn execute_delete(&self, op: OperationDescriptor) -> Result<()> {
        let Some(remote_id) = self.resolve_remote(&op).await? else {
            // Already unmapped: re-enqueued deletes are no-ops.
            debug!("Delete for {} is a no-op; already unmapped", op.agent_id);
            return Ok(());
        };

        let etag = match self.current_etag(&remote_id).await? {
            Some(etag) => etag,
            None => match self.planner.get_task(&remote_id).await {
                Ok(fetch) => fetch.etag,
                Err(BridgeError::RemoteNotFound(_)) => {
                    return self.teardown(&op, &remote_id, "delete target already gone").await;
                }
                Err(e) => return self.handle_failure(op, e).await,
            },
        };

        match self.planner.delete_task(&remote_id, &etag).await {
            Ok(()) => {
                self.mappings.unbind_by_agent(&op.agent_id).await?;
                self.health.record_sync_success().await;
                let _ = self
                    .pubsub
                    .publish_sync_confirmation(&SyncConfirmation::Removed {
                        agent_id: op.agent_id.clone(),
                    })
                    .await;
                self.logs
                    .sync(
                        SyncLogEntry::new(SyncEvent::Deleted, "deleted on planner")
                            .agent(&op.agent_id)
                            .remote(&remote_id),
                    )
                    .await?;
                info!("Deleted remote task {remote_id} for {}", op.agent_id);
                Ok(())
            }
            Err(BridgeError::RemoteNotFound(_)) => {
                self.teardown(&op, &remote_id, "delete target already gone").await
            }
            Err(BridgeError::PreconditionFailed { .. }) => {
                // Somebody edited between our etag read and the delete; one
                // fresh read and retry.
                let fresh = match self.planner.get_task(&remote_id).await {
                    Ok(fresh) => fresh,
                    Err(BridgeError::RemoteNotFound(_)) => {
                        return self.teardown(&op, &remote_id, "delete target already gone").await;
                    }
                    Err(e) => return self.handle_failure(op, e).await,
                };
                match self.planner.delete_task(&remote_id, &fresh.etag).await {
                    Ok(()) | Err(BridgeError::RemoteNotFound(_)) => {
                        self.mappings.unbind_by_agent(&op.agent_id).await?;
                        self.logs
                            .sync(
                                SyncLogEntry::new(SyncEvent::Deleted, "deleted on planner")
                                    .agent(&op.agent_id)
                                    .remote(&remote_id),
                            )
                            .await?;
                        Ok(())
                    }
                    Err(e) => self.handle_failure(op, e).await,
                }
            }
            Err(e) => self.handle_failure(op, e).await,
        }
    }

    // ---- failure plumbing ----

    async fn handle_failure(&self, mut op: OperationDescriptor, error: BridgeError) -> Result<()> {
        match &error {
            BridgeError::RateLimited { retry_after_secs } => {
                // The client is already paused; requeue without consuming
                // retry budget.
                self.logs
                    .sync(
                        SyncLogEntry::new(
                            SyncEvent::RateLimited,
                            format!("retry after {retry_after_secs}s"),
                        )
                        .agent(&op.agent_id),
                    )
                    .await?;
                op.attempt += 1;
                self.requeue_later(op, Duration::from_secs(*retry_after_secs)).await;
                Ok(())
            }
            BridgeError::Validation(_) | BridgeError::Serialization(_) => {
                // Operator intervention expected; retrying cannot help.
                self.logs
                    .sync(
                        SyncLogEntry::new(SyncEvent::OpFailed, error.to_string())
                            .agent(&op.agent_id),
                    )
                    .await?;
                self.ops.park_failed(&op, &error.to_string()).await
            }
            _ => {
                op.attempt += 1;
                if op.attempt > MAX_OP_ATTEMPTS {
                    self.logs
                        .sync(
                            SyncLogEntry::new(
                                SyncEvent::OpFailed,
                                format!("retry budget exhausted: {error}"),
                            )
                            .agent(&op.agent_id),
                        )
                        .await?;
                    return self.ops.park_failed(&op, &error.to_string()).await;
                }
                let delay = backoff_with_jitter(op.attempt);
                debug!(
                    "Retrying {:?} for {} in {:?} (attempt {}): {error}",
                    op.kind, op.agent_id, delay, op.attempt
                );
                self.requeue_later(op, delay).await;
                Ok(())
            }
        }
    }

    async fn requeue_later(&self, op: OperationDescriptor, delay: Duration) {
        let ops = self.ops.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = ops.enqueue(&op).await {
                error!("Could not requeue {:?} op for {}: {e}", op.kind, op.agent_id);
            }
        });
    }

    async fn teardown(
        &self,
        op: &OperationDescriptor,
        remote_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.mappings.unbind_by_agent(&op.agent_id).await?;
        self.logs
            .sync(
                SyncLogEntry::new(SyncEvent::MappingTornDown, reason)
                    .agent(&op.agent_id)
                    .remote(remote_id),
            )
            .await?;
        Ok(())
    }

    // ---- lookups ----

    async fn resolve_remote(&self, op: &OperationDescriptor) -> Result<Option<String>> {
        if let Some(remote_id) = &op.remote_id {
            if !remote_id.is_empty() {
                // The mapping may have been torn down since enqueue; the
                // mapping table is authoritative.
                if self.mappings.resolve_remote(&op.agent_id).await?.is_some() {
                    return Ok(Some(remote_id.clone()));
                }
                return Ok(None);
            }
        }
        self.mappings.resolve_remote(&op.agent_id).await
    }

    async fn current_etag(&self, remote_id: &str) -> Result<Option<String>> {
        self.mappings.etag(remote_id).await
    }

    async fn first_bucket(&self, plan_id: &str) -> Option<String> {
        match self.planner.list_plan_buckets(plan_id).await {
            Ok(buckets) => buckets.first().map(|b| b.id.clone()),
            Err(e) => {
                warn!("Could not list buckets for plan {plan_id}: {e}");
                None
            }
        }
    }
}

fn label_hint(task: &AgentTask, prefix: &str) -> Option<String> {
    task.labels
        .iter()
        .find_map(|label| label.strip_prefix(prefix).map(|rest| rest.to_string()))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(BACKOFF_CAP_SECS);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskPriority, TaskStatus};

    #[test]
    fn backoff_is_capped() {
        for attempt in 1..12 {
            let delay = backoff_with_jitter(attempt);
            assert!(delay <= Duration::from_secs(BACKOFF_CAP_SECS + 1));
        }
        assert!(backoff_with_jitter(1) >= Duration::from_secs(2));
    }

    #[test]
    fn label_hints_are_extracted() {
        let task = AgentTask {
            id: "t1".to_string(),
            title: "T".to_string(),
            description: String::new(),
            status: TaskStatus::NotStarted,
            percent_complete: 0.0,
            priority: TaskPriority::Normal,
            assigned_to: String::new(),
            due_date: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            conversation_id: None,
            labels: vec!["urgent-ish".to_string(), "plan:p42".to_string(), "bucket:b7".to_string()],
            checklist_items: Vec::new(),
            source_list: String::new(),
        };
        assert_eq!(label_hint(&task, PLAN_HINT_PREFIX).as_deref(), Some("p42"));
        assert_eq!(label_hint(&task, BUCKET_HINT_PREFIX).as_deref(), Some("b7"));
        assert_eq!(label_hint(&task, "missing:"), None);
    }
}
