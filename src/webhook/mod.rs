//! Webhook receiver for planner change notifications.
//!
//! Two request shapes arrive here: the validation handshake (echo the
//! `validationToken` back as text/plain) and notification batches. The
//! synchronous path is deliberately tiny: verify `clientState`, enqueue,
//! reply 202. Everything else, including the Redis audit log write, happens
//! off the handler.

use crate::config::WebhookConfig;
use crate::constants::WEBHOOK_QUEUE_CAPACITY;
use crate::redis::{keys, LogStore, RedisClient};
use crate::{BridgeError, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const ROUTE_HEALTH: &str = "/health";
const ROUTE_WEBHOOK: &str = "/webhook";

/// One raw notification as delivered by the planner's notification service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub resource_data: Option<serde_json::Value>,
    #[serde(default)]
    pub client_state: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub subscription_expiration_date_time: Option<String>,
    #[serde(default)]
    pub lifecycle_event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationBatch {
    #[serde(default = "Vec::new")]
    value: Vec<RawNotification>,
}

/// What changed, decoded from the notification's resource path. The payload
/// schema varies per resource family; parse once into a discriminated
/// variant carrying exactly what its branch needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceChange {
    Task { task_id: String },
    PlanTasks { plan_id: String },
    GroupActivity { group_id: String },
    ChatMessage { chat_id: String },
    ChannelMessage { team_id: String, channel_id: String },
    UserMessages { user_id: String },
    Unknown { resource: String },
}

fn resource_patterns() -> &'static [(&'static str, regex::Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, regex::Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ("task", regex::Regex::new(r"^/?tasks/([^/]+)$").unwrap()),
            ("plan_tasks", regex::Regex::new(r"^/?plans/([^/]+)/tasks/?$").unwrap()),
            ("group", regex::Regex::new(r"^/?groups/([^/]+)/?$").unwrap()),
            ("chat", regex::Regex::new(r"^/?chats/([^/]+)/messages/?$").unwrap()),
            (
                "channel",
                regex::Regex::new(r"^/?teams/([^/]+)/channels/([^/]+)/messages/?$").unwrap(),
            ),
            ("user", regex::Regex::new(r"^/?users/([^/]+)/messages/?$").unwrap()),
        ]
    })
}

impl ResourceChange {
    pub fn decode(resource: &str) -> Self {
        for (kind, pattern) in resource_patterns() {
            if let Some(captures) = pattern.captures(resource) {
                let first = captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                return match *kind {
                    "task" => ResourceChange::Task { task_id: first },
                    "plan_tasks" => ResourceChange::PlanTasks { plan_id: first },
                    "group" => ResourceChange::GroupActivity { group_id: first },
                    "chat" => ResourceChange::ChatMessage { chat_id: first },
                    "channel" => ResourceChange::ChannelMessage {
                        team_id: first,
                        channel_id: captures
                            .get(2)
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default(),
                    },
                    "user" => ResourceChange::UserMessages { user_id: first },
                    _ => ResourceChange::Unknown {
                        resource: resource.to_string(),
                    },
                };
            }
        }
        ResourceChange::Unknown {
            resource: resource.to_string(),
        }
    }
}

/// A notification that passed clientState verification, ready for the
/// download pipeline.
#[derive(Debug, Clone)]
pub struct VerifiedNotification {
    pub family: String,
    pub change_type: String,
    pub change: ResourceChange,
    pub subscription_id: String,
    pub raw: RawNotification,
}

/// Lifecycle events are for the subscription manager, not the download
/// pipeline.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub event: String,
    pub subscription_id: String,
    pub family: String,
}

/// clientState → family table maintained by the subscription manager.
#[derive(Clone, Default)]
pub struct ClientStateRegistry {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ClientStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client_state: String, family: String) {
        self.inner.write().await.insert(client_state, family);
    }

    pub async fn unregister(&self, client_state: &str) {
        self.inner.write().await.remove(client_state);
    }

    /// Constant-time membership check returning the owning family.
    pub async fn verify(&self, presented: &str) -> Option<String> {
        let table = self.inner.read().await;
        for (expected, family) in table.iter() {
            if expected
                .as_bytes()
                .ct_eq(presented.as_bytes())
                .unwrap_u8()
                == 1
            {
                return Some(family.clone());
            }
        }
        None
    }
}

/// Bounded in-memory notification queue: oldest dropped on overflow, with a
/// counter the health snapshot surfaces.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Mutex<VecDeque<VerifiedNotification>>>,
    notify: Arc<Notify>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            notify: Arc::new(Notify::new()),
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn push(&self, notification: VerifiedNotification) {
        let mut queue = self.inner.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(notification);
        drop(queue);
        self.notify.notify_one();
    }

    /// Take the next notification, waiting until one arrives.
    pub async fn take(&self) -> VerifiedNotification {
        loop {
            {
                let mut queue = self.inner.lock().await;
                if let Some(notification) = queue.pop_front() {
                    return notification;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Counters surfaced in the health snapshot.
#[derive(Clone, Default)]
pub struct WebhookCounters {
    pub received: Arc<AtomicU64>,
    pub rejected_client_state: Arc<AtomicU64>,
}

#[derive(Clone)]
struct ReceiverState {
    registry: ClientStateRegistry,
    queue: NotificationQueue,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    logs: LogStore,
    counters: WebhookCounters,
}

pub struct WebhookReceiver {
    config: WebhookConfig,
    state: ReceiverState,
    redis: RedisClient,
}

impl WebhookReceiver {
    pub fn new(
        config: WebhookConfig,
        redis: RedisClient,
        registry: ClientStateRegistry,
    ) -> (Self, NotificationQueue, mpsc::UnboundedReceiver<LifecycleEvent>, WebhookCounters) {
        let queue = NotificationQueue::new(WEBHOOK_QUEUE_CAPACITY);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let counters = WebhookCounters::default();

        let state = ReceiverState {
            registry,
            queue: queue.clone(),
            lifecycle_tx,
            logs: LogStore::new(redis.clone()),
            counters: counters.clone(),
        };

        (
            Self {
                config,
                state,
                redis,
            },
            queue,
            lifecycle_rx,
            counters,
        )
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route(ROUTE_HEALTH, get(health_snapshot))
            .route(ROUTE_WEBHOOK, get(validation_handshake).post(receive_batch))
            .layer(TraceLayer::new_for_http())
            .with_state((self.state.clone(), self.redis.clone()))
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let app = self.build_router();
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Internal(e.into()))?;

        info!("Webhook receiver listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| BridgeError::Internal(e.into()))?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct HandshakeQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

/// GET /webhook: the subscription validation handshake. The planner expects
/// the token echoed verbatim as text/plain.
async fn validation_handshake(Query(query): Query<HandshakeQuery>) -> impl IntoResponse {
    match query.validation_token {
        Some(token) => {
            debug!("Answered subscription validation handshake");
            (
                StatusCode::OK,
                [("content-type", "text/plain; charset=utf-8")],
                token,
            )
                .into_response()
        }
        None => (StatusCode::BAD_REQUEST, "missing validationToken").into_response(),
    }
}

/// POST /webhook: a notification batch, or a handshake delivered as POST
/// during subscription creation.
async fn receive_batch(
    State((state, _redis)): State<(ReceiverState, RedisClient)>,
    Query(query): Query<HandshakeQuery>,
    body: Option<Json<NotificationBatch>>,
) -> impl IntoResponse {
    if let Some(token) = query.validation_token {
        return (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            token,
        )
            .into_response();
    }

    let Some(Json(batch)) = body else {
        return (StatusCode::BAD_REQUEST, "expected notification batch").into_response();
    };

    for notification in batch.value {
        state.counters.received.fetch_add(1, Ordering::Relaxed);
        let disposition = dispatch_notification(&state, notification).await;
        debug!("Webhook notification disposition: {disposition}");
    }

    // 202 before any Redis round-trip completes; log writes were spawned.
    StatusCode::ACCEPTED.into_response()
}

/// Classify and route one notification. Returns a disposition label for the
/// audit record.
async fn dispatch_notification(state: &ReceiverState, raw: RawNotification) -> &'static str {
    let family = state.registry.verify(&raw.client_state).await;

    let disposition = match (&family, raw.lifecycle_event.as_deref()) {
        (None, _) => {
            state
                .counters
                .rejected_client_state
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "Discarding notification with unknown clientState (subscription {})",
                raw.subscription_id
            );
            "rejected_client_state"
        }
        (Some(family), Some(event)) => {
            let _ = state.lifecycle_tx.send(LifecycleEvent {
                event: event.to_string(),
                subscription_id: raw.subscription_id.clone(),
                family: family.clone(),
            });
            "lifecycle"
        }
        (Some(family), None) => {
            let verified = VerifiedNotification {
                family: family.clone(),
                change_type: raw.change_type.clone(),
                change: ResourceChange::decode(&raw.resource),
                subscription_id: raw.subscription_id.clone(),
                raw: raw.clone(),
            };
            state.queue.push(verified).await;
            "enqueued"
        }
    };

    // Audit record written off the response path.
    let logs = state.logs.clone();
    let record = serde_json::json!({
        "at": chrono::Utc::now(),
        "subscription_id": raw.subscription_id,
        "change_type": raw.change_type,
        "resource": raw.resource,
        "disposition": disposition,
    });
    tokio::spawn(async move {
        if let Err(e) = logs.webhook(&record).await {
            warn!("Could not append webhook log record: {e}");
        }
    });

    disposition
}

/// GET /health: the latest snapshot from Redis. Absence means the reporter
/// has been silent past its TTL, which is itself the signal.
async fn health_snapshot(
    State((_state, redis)): State<(ReceiverState, RedisClient)>,
) -> impl IntoResponse {
    match redis.json_get::<serde_json::Value>(keys::HEALTH, "$").await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unknown", "error": "no recent snapshot"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unknown", "error": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_task_resources() {
        assert_eq!(
            ResourceChange::decode("/tasks/R1"),
            ResourceChange::Task {
                task_id: "R1".to_string()
            }
        );
        assert_eq!(
            ResourceChange::decode("plans/p1/tasks"),
            ResourceChange::PlanTasks {
                plan_id: "p1".to_string()
            }
        );
    }

    #[test]
    fn decodes_message_family_resources() {
        assert_eq!(
            ResourceChange::decode("/chats/c1/messages"),
            ResourceChange::ChatMessage {
                chat_id: "c1".to_string()
            }
        );
        assert_eq!(
            ResourceChange::decode("/teams/t1/channels/ch1/messages"),
            ResourceChange::ChannelMessage {
                team_id: "t1".to_string(),
                channel_id: "ch1".to_string()
            }
        );
        assert_eq!(
            ResourceChange::decode("/users/u1/messages"),
            ResourceChange::UserMessages {
                user_id: "u1".to_string()
            }
        );
    }

    #[test]
    fn unknown_resources_are_tagged_not_dropped() {
        let decoded = ResourceChange::decode("/drives/d1/items");
        assert_eq!(
            decoded,
            ResourceChange::Unknown {
                resource: "/drives/d1/items".to_string()
            }
        );
    }

    #[tokio::test]
    async fn registry_verifies_known_states_only() {
        let registry = ClientStateRegistry::new();
        registry
            .register("spiral-bridge-chats-abc".to_string(), "chats".to_string())
            .await;

        assert_eq!(
            registry.verify("spiral-bridge-chats-abc").await.as_deref(),
            Some("chats")
        );
        assert!(registry.verify("spiral-bridge-chats-abd").await.is_none());
        assert!(registry.verify("").await.is_none());
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let queue = NotificationQueue::new(2);
        for i in 0..3 {
            queue
                .push(VerifiedNotification {
                    family: "group".to_string(),
                    change_type: "updated".to_string(),
                    change: ResourceChange::Task {
                        task_id: format!("R{i}"),
                    },
                    subscription_id: "s1".to_string(),
                    raw: RawNotification {
                        change_type: "updated".to_string(),
                        resource: format!("/tasks/R{i}"),
                        resource_data: None,
                        client_state: String::new(),
                        subscription_id: "s1".to_string(),
                        subscription_expiration_date_time: None,
                        lifecycle_event: None,
                    },
                })
                .await;
        }

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.dropped_count(), 1);
        // Oldest (R0) was dropped; R1 is now at the head.
        let head = queue.take().await;
        assert_eq!(
            head.change,
            ResourceChange::Task {
                task_id: "R1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn handshake_echoes_token_as_text_plain() {
        let response = validation_handshake(Query(HandshakeQuery {
            validation_token: Some("tok-123".to_string()),
        }))
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"));

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"tok-123");
    }

    #[tokio::test]
    async fn handshake_without_token_is_rejected() {
        let response = validation_handshake(Query(HandshakeQuery {
            validation_token: None,
        }))
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn batch_parses_planner_payload() {
        let json = r#"{
            "value": [{
                "changeType": "updated",
                "resource": "/tasks/R1",
                "clientState": "spiral-bridge-group-xyz",
                "subscriptionId": "sub-1",
                "subscriptionExpirationDateTime": "2025-12-01T00:00:00Z"
            }]
        }"#;
        let batch: NotificationBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.value.len(), 1);
        assert_eq!(batch.value[0].change_type, "updated");
        assert!(batch.value[0].lifecycle_event.is_none());
    }

    #[test]
    fn lifecycle_events_parse() {
        let json = r#"{
            "value": [{
                "lifecycleEvent": "subscriptionRemoved",
                "subscriptionId": "sub-2",
                "clientState": "spiral-bridge-chats-abc"
            }]
        }"#;
        let batch: NotificationBatch = serde_json::from_str(json).unwrap();
        assert_eq!(
            batch.value[0].lifecycle_event.as_deref(),
            Some("subscriptionRemoved")
        );
    }
}
