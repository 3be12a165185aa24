//! Change-notification subscription lifecycle.
//!
//! One subscription per resource family. The manager converges the live set
//! toward the desired set on startup and on a periodic scan, renews ahead of
//! expiry, and reacts to lifecycle events from the webhook receiver. A
//! family denied on both credentials is disabled; its polling fallback in
//! the download pipeline stays on.

use crate::config::{SubscriptionTargets, WebhookConfig};
use crate::constants::{SUBSCRIPTION_RENEW_FRACTION, SUBSCRIPTION_SCAN_INTERVAL_SECS};
use crate::graph::PlannerClient;
use crate::models::{SyncEvent, SyncLogEntry};
use crate::redis::{keys, LogStore, RedisClient};
use crate::token::TokenKind;
use crate::webhook::{ClientStateRegistry, LifecycleEvent};
use crate::{BridgeError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Resource families the sync depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    GroupActivity,
    Chats,
    Channels,
    UserMessages,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::GroupActivity => "group_activity",
            Family::Chats => "chats",
            Family::Channels => "channels",
            Family::UserMessages => "user_messages",
        }
    }

    /// Service-imposed maximum subscription lifetime.
    pub fn max_lifetime_minutes(&self) -> i64 {
        match self {
            // Message streams cap at one hour; the rest run for days.
            Family::Chats | Family::Channels => 60,
            Family::GroupActivity | Family::UserMessages => 4230,
        }
    }

    /// Which credential the family's subscription wants first.
    pub fn preferred_token_kind(&self) -> TokenKind {
        match self {
            Family::Chats | Family::Channels => TokenKind::Application,
            Family::GroupActivity | Family::UserMessages => TokenKind::Delegated,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired subscription for one family.
#[derive(Debug, Clone)]
pub struct FamilySpec {
    pub family: Family,
    pub resource_path: String,
    pub change_types: &'static str,
}

/// The Redis-resident subscription descriptor (`sub/{family}` hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub resource_path: String,
    pub change_types: String,
    pub client_state: String,
    pub required_token_kind: TokenKind,
    pub current_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Live status of a family, surfaced in the health snapshot and consulted
/// by the download pipeline's polling gate.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyStatus {
    pub status: FamilyState,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyState {
    Pending,
    Active,
    Disabled,
}

/// Shared per-family status table. The webhook/download side records event
/// arrivals; the manager records subscription state transitions.
#[derive(Clone, Default)]
pub struct FamilyTracker {
    inner: Arc<RwLock<HashMap<Family, FamilyStatus>>>,
}

impl FamilyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, family: Family, state: FamilyState) {
        let mut table = self.inner.write().await;
        let entry = table.entry(family).or_insert(FamilyStatus {
            status: state,
            last_event_at: None,
        });
        entry.status = state;
    }

    pub async fn record_event(&self, family: Family) {
        let mut table = self.inner.write().await;
        let entry = table.entry(family).or_insert(FamilyStatus {
            status: FamilyState::Active,
            last_event_at: None,
        });
        entry.last_event_at = Some(Utc::now());
    }

    pub async fn status(&self, family: Family) -> Option<FamilyStatus> {
        self.inner.read().await.get(&family).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, FamilyStatus> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(family, status)| (family.to_string(), status.clone()))
            .collect()
    }

    /// Whether the family's webhook coverage is live and fresh: an active
    /// subscription that delivered an event within the freshness window.
    pub async fn webhook_fresh(&self, family: Family, within_secs: u64) -> bool {
        let table = self.inner.read().await;
        match table.get(&family) {
            Some(status) if status.status == FamilyState::Active => status
                .last_event_at
                .map(|at| (Utc::now() - at).num_seconds() <= within_secs as i64)
                .unwrap_or(false),
            _ => false,
        }
    }
}

pub struct SubscriptionManager {
    planner: PlannerClient,
    redis: RedisClient,
    logs: LogStore,
    registry: ClientStateRegistry,
    tracker: FamilyTracker,
    webhook: WebhookConfig,
    desired: Vec<FamilySpec>,
}

impl SubscriptionManager {
    pub fn new(
        planner: PlannerClient,
        redis: RedisClient,
        registry: ClientStateRegistry,
        tracker: FamilyTracker,
        webhook: WebhookConfig,
        targets: &SubscriptionTargets,
    ) -> Self {
        let logs = LogStore::new(redis.clone());
        Self {
            planner,
            redis,
            logs,
            registry,
            tracker,
            webhook,
            desired: Self::desired_set(targets),
        }
    }

    /// Build the desired set from the configured targets. Families without
    /// a target identifier are not subscribed at all.
    fn desired_set(targets: &SubscriptionTargets) -> Vec<FamilySpec> {
        let mut desired = Vec::new();
        if let Some(group_id) = &targets.group_id {
            desired.push(FamilySpec {
                family: Family::GroupActivity,
                resource_path: format!("/groups/{group_id}"),
                change_types: "created,updated,deleted",
            });
        }
        if let Some(chat_id) = &targets.chat_id {
            desired.push(FamilySpec {
                family: Family::Chats,
                resource_path: format!("/chats/{chat_id}/messages"),
                change_types: "created,updated",
            });
        }
        if let (Some(team_id), Some(channel_id)) = (&targets.team_id, &targets.channel_id) {
            desired.push(FamilySpec {
                family: Family::Channels,
                resource_path: format!("/teams/{team_id}/channels/{channel_id}/messages"),
                change_types: "created,updated",
            });
        }
        if let Some(user_id) = &targets.message_user_id {
            desired.push(FamilySpec {
                family: Family::UserMessages,
                resource_path: format!("/users/{user_id}/messages"),
                change_types: "created,updated,deleted",
            });
        }
        desired
    }

    /// Main loop: converge on startup, then rescan hourly and react to
    /// lifecycle events in between.
    pub async fn run(
        &self,
        mut lifecycle_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Subscription manager started ({} desired families)",
            self.desired.len()
        );

        self.restore_registry().await;
        self.converge_all().await;

        let mut scan = tokio::time::interval(std::time::Duration::from_secs(
            SUBSCRIPTION_SCAN_INTERVAL_SECS,
        ));
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval fires immediately once; we already converged.
        scan.tick().await;

        loop {
            tokio::select! {
                _ = scan.tick() => {
                    self.converge_all().await;
                }
                event = lifecycle_rx.recv() => {
                    match event {
                        Some(event) => self.handle_lifecycle(event).await,
                        None => {
                            warn!("Lifecycle channel closed");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Subscription manager shutting down");
                    return;
                }
            }
        }
    }

    /// Re-register persisted clientStates with the webhook receiver so
    /// notifications survive a process restart.
    async fn restore_registry(&self) {
        for spec in &self.desired {
            match self.read_descriptor(spec.family).await {
                Ok(Some(descriptor)) => {
                    self.registry
                        .register(descriptor.client_state.clone(), spec.family.to_string())
                        .await;
                    let state = if descriptor.expires_at > Utc::now() {
                        FamilyState::Active
                    } else {
                        FamilyState::Pending
                    };
                    self.tracker.set_state(spec.family, state).await;
                }
                Ok(None) => self.tracker.set_state(spec.family, FamilyState::Pending).await,
                Err(e) => warn!("Could not restore {} descriptor: {e}", spec.family),
            }
        }
    }

    async fn converge_all(&self) {
        for spec in &self.desired {
            if let Err(e) = self.converge(spec).await {
                error!("Subscription convergence failed for {}: {e}", spec.family);
            }
        }
    }

    /// Ensure the family has a live subscription with comfortable remaining
    /// lifetime: create if absent, renew if inside the renewal threshold,
    /// delete + recreate if the renew is refused.
    async fn converge(&self, spec: &FamilySpec) -> Result<()> {
        if let Some(status) = self.tracker.status(spec.family).await {
            if status.status == FamilyState::Disabled {
                return Ok(());
            }
        }

        let descriptor = self.read_descriptor(spec.family).await?;
        match descriptor {
            None => self.create(spec).await,
            Some(descriptor) => {
                let max = ChronoDuration::minutes(spec.family.max_lifetime_minutes());
                let threshold =
                    ChronoDuration::seconds((max.num_seconds() as f64 * SUBSCRIPTION_RENEW_FRACTION) as i64);
                let remaining = descriptor.expires_at - Utc::now();

                if remaining > threshold {
                    return Ok(());
                }

                debug!(
                    "Renewing {} subscription {} ({}s left)",
                    spec.family,
                    descriptor.current_id,
                    remaining.num_seconds()
                );
                match self.renew(spec, &descriptor).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("Renew failed for {}; recreating: {e}", spec.family);
                        let _ = self
                            .planner
                            .delete_subscription_as(
                                descriptor.required_token_kind,
                                &descriptor.current_id,
                            )
                            .await;
                        self.registry.unregister(&descriptor.client_state).await;
                        self.create(spec).await
                    }
                }
            }
        }
    }

    async fn create(&self, spec: &FamilySpec) -> Result<()> {
        let client_state = format!(
            "{}-{}-{}",
            self.webhook.client_state_prefix,
            spec.family,
            uuid::Uuid::new_v4()
        );
        let expires_at = Utc::now() + ChronoDuration::minutes(spec.family.max_lifetime_minutes());
        let body = serde_json::json!({
            "changeType": spec.change_types,
            "notificationUrl": self.webhook.public_url,
            "resource": spec.resource_path,
            "expirationDateTime": expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "clientState": client_state,
        });

        // Family policy: preferred credential first, the other on 403, and
        // a denial on both disables the family.
        let preferred = spec.family.preferred_token_kind();
        let fallback = match preferred {
            TokenKind::Application => TokenKind::Delegated,
            TokenKind::Delegated => TokenKind::Application,
        };

        let (kind, created) = match self.planner.create_subscription_as(preferred, &body).await {
            Ok(created) => (preferred, created),
            Err(BridgeError::PermissionDenied { .. }) => {
                debug!(
                    "{} denied with {preferred} token; retrying with {fallback}",
                    spec.family
                );
                match self.planner.create_subscription_as(fallback, &body).await {
                    Ok(created) => (fallback, created),
                    Err(BridgeError::PermissionDenied { message }) => {
                        warn!(
                            "{} denied on both credentials; disabling family (polling stays on): {message}",
                            spec.family
                        );
                        self.tracker.set_state(spec.family, FamilyState::Disabled).await;
                        let _ = self
                            .logs
                            .sync(SyncLogEntry::new(
                                SyncEvent::SubscriptionChange,
                                format!("{} disabled: denied on both credentials", spec.family),
                            ))
                            .await;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let current_id = created
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let expires_at = created
            .get("expirationDateTime")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .unwrap_or(expires_at);

        if current_id.is_empty() {
            return Err(BridgeError::Subscription {
                family: spec.family.to_string(),
                message: "create response carried no subscription id".to_string(),
            });
        }

        let descriptor = SubscriptionDescriptor {
            resource_path: spec.resource_path.clone(),
            change_types: spec.change_types.to_string(),
            client_state: client_state.clone(),
            required_token_kind: kind,
            current_id: current_id.clone(),
            expires_at,
        };
        self.write_descriptor(spec.family, &descriptor).await?;
        self.registry.register(client_state, spec.family.to_string()).await;
        self.tracker.set_state(spec.family, FamilyState::Active).await;

        info!(
            "Created {} subscription {} (expires {})",
            spec.family, current_id, expires_at
        );
        Ok(())
    }

    async fn renew(&self, spec: &FamilySpec, descriptor: &SubscriptionDescriptor) -> Result<()> {
        let expires_at = Utc::now() + ChronoDuration::minutes(spec.family.max_lifetime_minutes());
        let body = serde_json::json!({
            "expirationDateTime": expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });

        self.planner
            .renew_subscription_as(descriptor.required_token_kind, &descriptor.current_id, &body)
            .await?;

        let mut updated = descriptor.clone();
        updated.expires_at = expires_at;
        self.write_descriptor(spec.family, &updated).await?;
        debug!("Renewed {} subscription until {expires_at}", spec.family);
        Ok(())
    }

    async fn handle_lifecycle(&self, event: LifecycleEvent) {
        info!(
            "Lifecycle event '{}' for subscription {} ({})",
            event.event, event.subscription_id, event.family
        );

        let Some(spec) = self
            .desired
            .iter()
            .find(|spec| spec.family.to_string() == event.family)
        else {
            warn!("Lifecycle event for unknown family {}", event.family);
            return;
        };

        match event.event.as_str() {
            "subscriptionRemoved" => {
                // The service already killed it; recreate immediately.
                if let Ok(Some(descriptor)) = self.read_descriptor(spec.family).await {
                    self.registry.unregister(&descriptor.client_state).await;
                }
                let _ = self.clear_descriptor(spec.family).await;
                if let Err(e) = self.create(spec).await {
                    error!("Recreate after removal failed for {}: {e}", spec.family);
                }
            }
            "reauthorizationRequired" => {
                if let Ok(Some(descriptor)) = self.read_descriptor(spec.family).await {
                    if let Err(e) = self.renew(spec, &descriptor).await {
                        warn!("Reauthorization renew failed for {}; recreating: {e}", spec.family);
                        let _ = self.clear_descriptor(spec.family).await;
                        if let Err(e) = self.create(spec).await {
                            error!("Recreate after reauthorization failed: {e}");
                        }
                    }
                }
            }
            other => debug!("Ignoring lifecycle event '{other}'"),
        }
    }

    async fn read_descriptor(&self, family: Family) -> Result<Option<SubscriptionDescriptor>> {
        let mut conn = self.redis.get_conn().await?;
        let raw: HashMap<String, String> = conn.hgetall(keys::subscription(family.as_str())).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let descriptor = SubscriptionDescriptor {
            resource_path: raw.get("resource_path").cloned().unwrap_or_default(),
            change_types: raw.get("change_types").cloned().unwrap_or_default(),
            client_state: raw.get("client_state").cloned().unwrap_or_default(),
            required_token_kind: match raw.get("required_token_kind").map(String::as_str) {
                Some("application") => TokenKind::Application,
                _ => TokenKind::Delegated,
            },
            current_id: raw.get("current_id").cloned().unwrap_or_default(),
            expires_at: raw
                .get("expires_at")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|v| v.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        };
        Ok(Some(descriptor))
    }

    async fn write_descriptor(
        &self,
        family: Family,
        descriptor: &SubscriptionDescriptor,
    ) -> Result<()> {
        let mut conn = self.redis.get_conn().await?;
        let key = keys::subscription(family.as_str());
        let fields = [
            ("resource_path", descriptor.resource_path.clone()),
            ("change_types", descriptor.change_types.clone()),
            ("client_state", descriptor.client_state.clone()),
            (
                "required_token_kind",
                descriptor.required_token_kind.as_str().to_string(),
            ),
            ("current_id", descriptor.current_id.clone()),
            (
                "expires_at",
                descriptor.expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
        ];
        conn.hset_multiple::<_, _, _, ()>(&key, &fields).await?;
        Ok(())
    }

    async fn clear_descriptor(&self, family: Family) -> Result<()> {
        let mut conn = self.redis.get_conn().await?;
        conn.del::<_, ()>(keys::subscription(family.as_str())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_set_follows_configured_targets() {
        let targets = SubscriptionTargets {
            group_id: Some("g1".to_string()),
            chat_id: Some("c1".to_string()),
            team_id: None,
            channel_id: Some("ch1".to_string()),
            message_user_id: None,
        };
        let desired = SubscriptionManager::desired_set(&targets);

        // Channels need both team and channel ids; only two families qualify.
        assert_eq!(desired.len(), 2);
        assert_eq!(desired[0].family, Family::GroupActivity);
        assert_eq!(desired[0].resource_path, "/groups/g1");
        assert_eq!(desired[1].family, Family::Chats);
        assert_eq!(desired[1].resource_path, "/chats/c1/messages");
    }

    #[test]
    fn family_credential_preferences() {
        assert_eq!(Family::Chats.preferred_token_kind(), TokenKind::Application);
        assert_eq!(Family::Channels.preferred_token_kind(), TokenKind::Application);
        assert_eq!(Family::GroupActivity.preferred_token_kind(), TokenKind::Delegated);
        assert_eq!(Family::UserMessages.preferred_token_kind(), TokenKind::Delegated);
    }

    #[test]
    fn message_families_have_short_lifetimes() {
        assert_eq!(Family::Chats.max_lifetime_minutes(), 60);
        assert_eq!(Family::Channels.max_lifetime_minutes(), 60);
        assert!(Family::GroupActivity.max_lifetime_minutes() > 60 * 24);
    }

    #[tokio::test]
    async fn tracker_freshness_gate() {
        let tracker = FamilyTracker::new();

        // No subscription at all: not fresh.
        assert!(!tracker.webhook_fresh(Family::Chats, 600).await);

        // Active but silent: not fresh.
        tracker.set_state(Family::Chats, FamilyState::Active).await;
        assert!(!tracker.webhook_fresh(Family::Chats, 600).await);

        // Active with a recent event: fresh.
        tracker.record_event(Family::Chats).await;
        assert!(tracker.webhook_fresh(Family::Chats, 600).await);

        // Disabled families are never fresh regardless of events.
        tracker.set_state(Family::Chats, FamilyState::Disabled).await;
        assert!(!tracker.webhook_fresh(Family::Chats, 600).await);
    }
}
