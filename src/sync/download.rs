//! Download pipeline: planner-side changes into the conscious state.
//!
//! Fed by the webhook receiver's queue, with a polling fallback per plan
//! that switches itself off while webhook coverage is live and fresh.
//! Remote changes are reconciled against local state with the
//! timestamp-based conflict rule and written back through JSONPath-scoped
//! Redis updates.

use crate::adapter;
use crate::config::{SyncConfig, TieDirection};
use crate::constants::{DRIFT_INTERVAL_SECS, WEBHOOK_FRESHNESS_SECS};
use crate::graph::{MetadataCache, PlannerApi, TaskFetch};
use crate::health::HealthState;
use crate::models::{SyncEvent, SyncLogEntry};
use crate::redis::pubsub::{SyncConfirmation, TaskUpdateEvent};
use crate::redis::{LogStore, MappingStore, PubSubHandle, StateStore};
use crate::subscriptions::{Family, FamilyTracker};
use crate::sync::TaskLocks;
use crate::webhook::{NotificationQueue, ResourceChange, VerifiedNotification};
use crate::{BridgeError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// How long a plan stays "active" (fast-poll cadence) after its last
/// observed change.
const PLAN_ACTIVITY_WINDOW: Duration = Duration::from_secs(3600);

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "group_activity" => Ok(Family::GroupActivity),
            "chats" => Ok(Family::Chats),
            "channels" => Ok(Family::Channels),
            "user_messages" => Ok(Family::UserMessages),
            _ => Err(format!("Unknown family: {s}")),
        }
    }
}

#[derive(Debug)]
struct PlanPollState {
    last_polled: Option<Instant>,
    last_activity: Option<Instant>,
}

pub struct DownloadPipeline {
    config: SyncConfig,
    state: StateStore,
    mappings: MappingStore,
    logs: LogStore,
    planner: Arc<dyn PlannerApi>,
    pubsub: PubSubHandle,
    locks: TaskLocks,
    health: HealthState,
    tracker: FamilyTracker,
    queue: NotificationQueue,
    metadata: MetadataCache,
    poll_state: Mutex<HashMap<String, PlanPollState>>,
}

impl DownloadPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        state: StateStore,
        mappings: MappingStore,
        logs: LogStore,
        planner: Arc<dyn PlannerApi>,
        pubsub: PubSubHandle,
        locks: TaskLocks,
        health: HealthState,
        tracker: FamilyTracker,
        queue: NotificationQueue,
        metadata: MetadataCache,
    ) -> Self {
        Self {
            config,
            state,
            mappings,
            logs,
            planner,
            pubsub,
            locks,
            health,
            tracker,
            queue,
            metadata,
            poll_state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            "Download pipeline started ({} workers)",
            self.config.download_workers
        );

        let mut handles = Vec::new();

        for worker_id in 0..self.config.download_workers {
            let worker = self.clone();
            let worker_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.worker_loop(worker_id, worker_shutdown).await;
            }));
        }

        let poller = self.clone();
        let poll_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            poller.poll_loop(poll_shutdown).await;
        }));

        for handle in handles {
            let _ = handle.await;
        }
        info!("Download pipeline stopped");
    }

    // ---- webhook-driven path ----

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("Download worker {worker_id} started");
        loop {
            let notification = tokio::select! {
                notification = self.queue.take() => notification,
                _ = shutdown.changed() => return,
            };

            if let Err(e) = self.handle_notification(notification).await {
                warn!("Download worker {worker_id}: notification failed: {e}");
            }
        }
    }

    async fn handle_notification(&self, notification: VerifiedNotification) -> Result<()> {
        if let Ok(family) = Family::from_str(&notification.family) {
            self.tracker.record_event(family).await;
        }

        match &notification.change {
            ResourceChange::Task { task_id } => {
                self.process_remote_change(task_id, &notification.change_type)
                    .await
            }
            ResourceChange::PlanTasks { plan_id } => {
                let _ = self.metadata.invalidate("plan_buckets", plan_id).await;
                self.scan_plan(plan_id).await?;
                Ok(())
            }
            ResourceChange::GroupActivity { group_id } => {
                // Group-level notifications do not name the task; rescan the
                // plan the group hosts and drop the group's directory cache.
                let _ = self.metadata.invalidate("group_plans", group_id).await;
                self.scan_plan(&self.config.default_plan_id.clone()).await?;
                Ok(())
            }
            ResourceChange::ChatMessage { .. }
            | ResourceChange::ChannelMessage { .. }
            | ResourceChange::UserMessages { .. } => {
                // Message streams keep their subscriptions warm but carry no
                // task-graph changes.
                debug!("Message-family notification acknowledged");
                Ok(())
            }
            ResourceChange::Unknown { resource } => {
                debug!("Dropping notification for unknown resource '{resource}'");
                Ok(())
            }
        }
    }

    async fn process_remote_change(&self, remote_id: &str, change_type: &str) -> Result<()> {
        if change_type == "deleted" {
            return self.handle_remote_delete(remote_id).await;
        }

        let etag = self.mappings.etag(remote_id).await?;
        let fetch = match self
            .planner
            .get_task_if_modified(remote_id, etag.as_deref())
            .await
        {
            Ok(Some(fetch)) => fetch,
            Ok(None) => {
                // 304: confirmed no-op.
                debug!("Remote task {remote_id} unchanged (304)");
                return Ok(());
            }
            Err(BridgeError::RemoteNotFound(_)) => {
                return self.handle_remote_delete(remote_id).await;
            }
            Err(e) => return Err(e),
        };

        self.apply_remote(fetch).await
    }

    /// A remote deletion removes the agent-side task, the mapping, and
    /// every sidecar. Applying it twice is a no-op.
    async fn handle_remote_delete(&self, remote_id: &str) -> Result<()> {
        let Some(agent_id) = self.mappings.resolve_agent(remote_id).await? else {
            debug!("Remote delete for unmapped {remote_id}; nothing to do");
            return Ok(());
        };

        let _guard = self.locks.acquire_agent(&agent_id).await;

        if let Some((location, _)) = self.state.find_task(&agent_id).await? {
            self.state.remove_task(&location, &agent_id).await?;
        }
        self.mappings.unbind_by_agent(&agent_id).await?;

        let _ = self
            .pubsub
            .publish_sync_confirmation(&SyncConfirmation::Removed {
                agent_id: agent_id.clone(),
            })
            .await;
        self.logs
            .sync(
                SyncLogEntry::new(SyncEvent::Deleted, "deleted from planner")
                    .agent(&agent_id)
                    .remote(remote_id),
            )
            .await?;
        info!("Removed agent task {agent_id}; remote {remote_id} was deleted");
        Ok(())
    }

    /// Reconcile one fetched remote snapshot into the conscious state.
    async fn apply_remote(&self, fetch: TaskFetch) -> Result<()> {
        let remote_id = fetch.task.id.clone();

        // Echo suppression: a snapshot identical to the last one we stored
        // is our own upload coming back around.
        if let Some(cached) = self.mappings.cached_remote(&remote_id).await? {
            if remote_tasks_equal(&cached, &fetch.task) {
                self.mappings.set_etag(&remote_id, &fetch.etag).await?;
                debug!("Suppressed no-op echo for {remote_id}");
                return Ok(());
            }
        }

        match self.mappings.resolve_agent(&remote_id).await? {
            None => self.create_agent_task(fetch).await,
            Some(agent_id) => self.reconcile_update(&agent_id, fetch).await,
        }
    }

    /// Remote-origin creation: build the agent task, insert it into the
    /// configured list, bind. Guarded by a per-remote-id lock so two
    /// notifications for the same new task cannot double-create.
    async fn create_agent_task(&self, fetch: TaskFetch) -> Result<()> {
        let remote_id = fetch.task.id.clone();
        let _guard = self.locks.acquire_remote(&remote_id).await;

        // The mapping may have appeared while we waited on the guard.
        if self.mappings.resolve_agent(&remote_id).await?.is_some() {
            return Ok(());
        }

        let agent_task = adapter::to_agent(&fetch.task, None, &self.config.user_id_map);
        self.state.insert_task(&agent_task).await?;
        self.mappings.bind(&agent_task.id, &remote_id).await?;
        self.mappings.set_etag(&remote_id, &fetch.etag).await?;
        self.mappings.set_cached_remote(&remote_id, &fetch.task).await?;
        self.mappings
            .set_last_upload(&agent_task.id, agent_task.updated_at.timestamp())
            .await?;
        self.health.record_sync_success().await;
        self.mark_plan_active(&fetch.task.plan_id).await;

        let _ = self
            .pubsub
            .publish_task_update(&TaskUpdateEvent::RemoteEdit {
                agent_id: agent_task.id.clone(),
                remote_id: remote_id.clone(),
            })
            .await;
        let _ = self
            .pubsub
            .publish_sync_confirmation(&SyncConfirmation::Downloaded {
                agent_id: agent_task.id.clone(),
                remote_id: remote_id.clone(),
            })
            .await;
        self.logs
            .sync(
                SyncLogEntry::new(SyncEvent::Created, "created from planner")
                    .agent(&agent_task.id)
                    .remote(&remote_id),
            )
            .await?;
        info!("Created agent task {} from remote {remote_id}", agent_task.id);
        Ok(())
    }

    /// Conflict resolution for a mapped task both sides may have touched.
    async fn reconcile_update(&self, agent_id: &str, fetch: TaskFetch) -> Result<()> {
        let remote_id = fetch.task.id.clone();
        let _guard = self.locks.acquire_agent(agent_id).await;

        let Some((location, agent_task)) = self.state.find_task(agent_id).await? else {
            // Locally deleted with the delete op still queued; the upload
            // pipeline owns this task's fate.
            debug!("Agent task {agent_id} absent; leaving remote change to upload delete");
            return Ok(());
        };

        let t_agent = agent_task.updated_at;
        let t_remote = fetch.task.last_modified_date_time.unwrap_or_else(Utc::now);
        let delta = (t_agent - t_remote).num_seconds().abs();

        let last_upload = self.mappings.last_upload(agent_id).await?.unwrap_or(0);
        let agent_has_unsynced_edit = t_agent.timestamp() > last_upload;

        let remote_wins = remote_wins(
            t_agent,
            t_remote,
            self.config.conflict_grace_window_secs,
            self.config.conflict_tie_wins,
        );

        if remote_wins {
            let merged = adapter::to_agent(&fetch.task, Some(&agent_task), &self.config.user_id_map);
            // Per-field merge: only the remote-owned fields are written, as
            // JSONPath-scoped updates, so a concurrent agent edit to an
            // agent-owned field (labels, checklist) is never clobbered.
            self.state
                .patch_task_fields(&location, &remote_owned_fields(&merged)?)
                .await?;
            self.state.mirror_task(&merged).await?;
            self.mappings.set_etag(&remote_id, &fetch.etag).await?;
            self.mappings.set_cached_remote(&remote_id, &fetch.task).await?;
            // Write-backs must not re-trigger the upload diff.
            self.mappings
                .set_last_upload(agent_id, merged.updated_at.timestamp().max(Utc::now().timestamp()))
                .await?;
            self.health.record_sync_success().await;
            self.mark_plan_active(&fetch.task.plan_id).await;

            if agent_has_unsynced_edit {
                self.logs
                    .sync(
                        SyncLogEntry::new(
                            SyncEvent::ConflictRemoteWon,
                            format!("delta {delta}s, grace {}s", self.config.conflict_grace_window_secs),
                        )
                        .agent(agent_id)
                        .remote(&remote_id),
                    )
                    .await?;
            }

            let _ = self
                .pubsub
                .publish_task_update(&TaskUpdateEvent::RemoteEdit {
                    agent_id: agent_id.to_string(),
                    remote_id: remote_id.clone(),
                })
                .await;
            let _ = self
                .pubsub
                .publish_sync_confirmation(&SyncConfirmation::Downloaded {
                    agent_id: agent_id.to_string(),
                    remote_id,
                })
                .await;
            debug!("Remote change applied to agent task {agent_id}");
        } else {
            // Agent wins: nothing is written here; poke the upload side so
            // the remote converges to the agent's state.
            self.mappings.set_etag(&remote_id, &fetch.etag).await?;
            self.mappings.set_cached_remote(&remote_id, &fetch.task).await?;
            self.logs
                .sync(
                    SyncLogEntry::new(
                        SyncEvent::ConflictAgentWon,
                        format!("agent edit newer by {delta}s"),
                    )
                    .agent(agent_id)
                    .remote(&remote_id),
                )
                .await?;
            let _ = self
                .pubsub
                .publish_task_update(&TaskUpdateEvent::AgentEdit {
                    agent_id: agent_id.to_string(),
                })
                .await;
            debug!("Agent edit wins for {agent_id}; upload pipeline poked");
        }

        Ok(())
    }

    // ---- polling fallback ----

    async fn poll_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(DRIFT_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }

            // Gate: while the task-graph family's webhook is live and has
            // delivered within the freshness window, polling is redundant.
            if self
                .tracker
                .webhook_fresh(Family::GroupActivity, WEBHOOK_FRESHNESS_SECS)
                .await
            {
                continue;
            }

            let plan_id = self.config.default_plan_id.clone();
            if !self.poll_due(&plan_id).await {
                continue;
            }

            debug!("Polling plan {plan_id}");
            match self.scan_plan(&plan_id).await {
                Ok(changes) => {
                    let mut poll_state = self.poll_state.lock().await;
                    let entry = poll_state.entry(plan_id).or_insert(PlanPollState {
                        last_polled: None,
                        last_activity: None,
                    });
                    entry.last_polled = Some(Instant::now());
                    if changes > 0 {
                        entry.last_activity = Some(Instant::now());
                    }
                }
                Err(e) => error!("Plan poll failed: {e}"),
            }
        }
    }

    /// Whether the plan's poll cadence has elapsed: active plans poll fast,
    /// quiet plans back off.
    async fn poll_due(&self, plan_id: &str) -> bool {
        let poll_state = self.poll_state.lock().await;
        let Some(entry) = poll_state.get(plan_id) else {
            return true;
        };
        let Some(last_polled) = entry.last_polled else {
            return true;
        };

        let active = entry
            .last_activity
            .map(|at| at.elapsed() < PLAN_ACTIVITY_WINDOW)
            .unwrap_or(false);
        let cadence = if active {
            Duration::from_secs(self.config.poll_interval_active_secs)
        } else {
            Duration::from_secs(self.config.poll_interval_quiet_secs)
        };
        last_polled.elapsed() >= cadence
    }

    /// Reconcile every task in a plan; returns how many produced changes.
    async fn scan_plan(&self, plan_id: &str) -> Result<usize> {
        let tasks = self.planner.list_plan_tasks(plan_id).await?;
        let mut changes = 0usize;

        for task in tasks {
            if task.id.is_empty() {
                continue;
            }
            // Listing bodies carry the etag inline.
            let etag = task.etag.clone();
            let unchanged = match self.mappings.cached_remote(&task.id).await? {
                Some(cached) => remote_tasks_equal(&cached, &task),
                None => false,
            };
            if unchanged {
                continue;
            }
            changes += 1;
            if let Err(e) = self.apply_remote(TaskFetch { task, etag }).await {
                warn!("Reconciling a polled task failed: {e}");
            }
        }

        debug!("Plan {plan_id} scan: {changes} changed tasks");
        Ok(changes)
    }

    async fn mark_plan_active(&self, plan_id: &str) {
        if plan_id.is_empty() {
            return;
        }
        let mut poll_state = self.poll_state.lock().await;
        let entry = poll_state.entry(plan_id.to_string()).or_insert(PlanPollState {
            last_polled: None,
            last_activity: None,
        });
        entry.last_activity = Some(Instant::now());
    }
}

/// The fields the remote side owns authoritatively, as a JSONPath patch set
/// for the conscious-state document.
fn remote_owned_fields(
    merged: &crate::models::AgentTask,
) -> crate::Result<serde_json::Map<String, serde_json::Value>> {
    let mut fields = serde_json::Map::new();
    fields.insert("title".to_string(), serde_json::to_value(&merged.title)?);
    fields.insert(
        "description".to_string(),
        serde_json::to_value(&merged.description)?,
    );
    fields.insert("status".to_string(), serde_json::to_value(merged.status)?);
    fields.insert(
        "percent_complete".to_string(),
        serde_json::to_value(merged.percent_complete)?,
    );
    fields.insert(
        "priority".to_string(),
        serde_json::to_value(merged.priority)?,
    );
    fields.insert(
        "due_date".to_string(),
        serde_json::to_value(&merged.due_date)?,
    );
    fields.insert(
        "assigned_to".to_string(),
        serde_json::to_value(&merged.assigned_to)?,
    );
    fields.insert(
        "updated_at".to_string(),
        serde_json::to_value(merged.updated_at)?,
    );
    Ok(fields)
}

/// The conflict rule. Inside the grace window the configured tie direction
/// decides (default: remote, preferring the humans' edit in near-ties);
/// outside it, the later timestamp wins.
pub fn remote_wins(
    t_agent: chrono::DateTime<Utc>,
    t_remote: chrono::DateTime<Utc>,
    grace_window_secs: i64,
    tie_direction: TieDirection,
) -> bool {
    let delta = (t_agent - t_remote).num_seconds().abs();
    if delta <= grace_window_secs {
        tie_direction == TieDirection::Remote
    } else {
        t_remote > t_agent
    }
}

/// Content equality modulo version metadata; used for echo suppression.
fn remote_tasks_equal(a: &crate::models::RemoteTask, b: &crate::models::RemoteTask) -> bool {
    a.title == b.title
        && a.notes == b.notes
        && a.percent_complete == b.percent_complete
        && a.priority == b.priority
        && a.due_date_time == b.due_date_time
        && a.bucket_id == b.bucket_id
        && a.assignments.len() == b.assignments.len()
        && a.assignments.keys().all(|k| b.assignments.contains_key(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteTask;

    fn remote(title: &str, percent: u8) -> RemoteTask {
        RemoteTask {
            id: "R1".to_string(),
            title: title.to_string(),
            percent_complete: percent,
            priority: 5,
            etag: "W/\"1\"".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn echo_suppression_ignores_version_metadata() {
        let mut a = remote("Draft", 50);
        let mut b = remote("Draft", 50);
        a.etag = "W/\"1\"".to_string();
        b.etag = "W/\"2\"".to_string();
        b.last_modified_date_time = Some(Utc::now());
        assert!(remote_tasks_equal(&a, &b));
    }

    #[test]
    fn content_changes_defeat_suppression() {
        let a = remote("Draft", 50);
        assert!(!remote_tasks_equal(&a, &remote("Draft", 75)));
        assert!(!remote_tasks_equal(&a, &remote("Draft v2", 50)));
    }

    #[test]
    fn family_parses_from_status_keys() {
        assert_eq!(Family::from_str("chats").unwrap(), Family::Chats);
        assert_eq!(
            Family::from_str("group_activity").unwrap(),
            Family::GroupActivity
        );
        assert!(Family::from_str("files").is_err());
    }

    #[test]
    fn remote_owned_field_set_excludes_agent_owned_fields() {
        let mut task = crate::models::AgentTask {
            id: "A1".to_string(),
            title: "Draft".to_string(),
            description: String::new(),
            status: crate::models::TaskStatus::InProgress,
            percent_complete: 0.75,
            priority: crate::models::TaskPriority::Normal,
            assigned_to: String::new(),
            due_date: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            conversation_id: Some("c1".to_string()),
            labels: vec!["writing".to_string()],
            checklist_items: Vec::new(),
            source_list: "active_tasks".to_string(),
        };
        task.labels.push("plan:p1".to_string());

        let fields = remote_owned_fields(&task).unwrap();
        assert!(fields.contains_key("title"));
        assert!(fields.contains_key("percent_complete"));
        assert!(fields.contains_key("updated_at"));
        assert!(!fields.contains_key("labels"));
        assert!(!fields.contains_key("checklist_items"));
        assert!(!fields.contains_key("source_list"));
        assert!(!fields.contains_key("conversation_id"));
        assert!(!fields.contains_key("id"));
    }

    #[test]
    fn conflict_rule_prefers_remote_in_near_ties() {
        let t = Utc::now();
        let eight_later = t + chrono::Duration::seconds(8);

        // Agent at t, remote at t+8: inside the window, so remote wins.
        assert!(remote_wins(t, eight_later, 30, TieDirection::Remote));
        // The knob flips the near-tie direction.
        assert!(!remote_wins(t, eight_later, 30, TieDirection::Agent));
    }

    #[test]
    fn conflict_rule_boundary_is_inclusive() {
        let t = Utc::now();
        let exactly_thirty = t + chrono::Duration::seconds(30);
        // A delta of exactly the grace window still counts as a tie.
        assert!(remote_wins(exactly_thirty, t, 30, TieDirection::Remote));
    }

    #[test]
    fn conflict_rule_later_wins_outside_window() {
        let t = Utc::now();
        let minute_later = t + chrono::Duration::seconds(60);

        // Remote is a minute newer: remote wins regardless of tie knob.
        assert!(remote_wins(t, minute_later, 30, TieDirection::Agent));
        // Agent is a minute newer: agent wins.
        assert!(!remote_wins(minute_later, t, 30, TieDirection::Remote));
    }
}
