//! Pub/sub plumbing: keyspace notifications and agent change announcements
//! in, task-update and sync-confirmation events out.
//!
//! The listener holds a dedicated pub/sub connection (pooled connections
//! cannot enter subscriber mode) and fans messages out over a broadcast
//! channel. On connection loss it reconnects with a short delay; the drift
//! timer covers anything missed in between.

use super::{keys, RedisClient};
use crate::Result;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// A change signal feeding the upload pipeline's debounce window.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeSignal {
    /// A conscious-state document mutated (keyspace notification).
    StateChanged { key: String },
    /// An agent announced a fine-grained change on `tasks/updates`.
    TaskAnnounced { agent_id: Option<String> },
}

/// Event published on `tasks/updates` when the download pipeline writes an
/// agent-side task, and consumed from the same channel when agents announce
/// their own writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskUpdateEvent {
    AgentEdit { agent_id: String },
    RemoteEdit { agent_id: String, remote_id: String },
}

/// Sync confirmation published on `tasks/sync` after an upload commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncConfirmation {
    Uploaded { agent_id: String, remote_id: String },
    Downloaded { agent_id: String, remote_id: String },
    Removed { agent_id: String },
}

#[derive(Clone)]
pub struct PubSubHandle {
    client: RedisClient,
    tx: broadcast::Sender<ChangeSignal>,
}

impl PubSubHandle {
    pub fn new(client: RedisClient) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { client, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.tx.subscribe()
    }

    /// Spawn the listener loop. Runs until the process exits; each
    /// iteration re-establishes the subscriber connection.
    pub fn start_listener(&self) {
        let client = self.client.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = Self::listen_loop(&client, &tx).await {
                    error!("Pub/sub listener error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        });
    }

    async fn listen_loop(client: &RedisClient, tx: &broadcast::Sender<ChangeSignal>) -> Result<()> {
        let redis_client = redis::Client::open(client.url())?;
        let mut pubsub = redis_client.get_async_pubsub().await?;

        pubsub.subscribe(keys::CHANNEL_TASK_UPDATES).await?;
        pubsub
            .psubscribe(format!("__keyspace@*__:{}", keys::STATE_GLOBAL))
            .await?;
        pubsub
            .psubscribe(format!("__keyspace@*__:{}*", keys::STATE_CONV_PREFIX))
            .await?;
        pubsub
            .psubscribe(format!("__keyspace@*__:{}*", keys::TASK_PREFIX))
            .await?;

        info!("Pub/sub listener started");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            if channel == keys::CHANNEL_TASK_UPDATES {
                let payload: String = msg.get_payload()?;
                match serde_json::from_str::<TaskUpdateEvent>(&payload) {
                    // Our own write-backs come around on this channel too;
                    // only agent-origin edits schedule a diff.
                    Ok(TaskUpdateEvent::AgentEdit { agent_id }) => {
                        let _ = tx.send(ChangeSignal::TaskAnnounced {
                            agent_id: Some(agent_id),
                        });
                    }
                    Ok(TaskUpdateEvent::RemoteEdit { .. }) => {
                        debug!("Ignoring own remote-edit echo on tasks/updates");
                    }
                    Err(_) => {
                        // Free-form announcements still count as a signal.
                        let _ = tx.send(ChangeSignal::TaskAnnounced { agent_id: None });
                    }
                }
            } else if let Some(key) = channel.split(':').nth(1) {
                let _ = tx.send(ChangeSignal::StateChanged {
                    key: key.to_string(),
                });
            } else {
                warn!("Unrecognized pub/sub channel: {channel}");
            }
        }

        Err(crate::BridgeError::Transient {
            message: "pub/sub stream ended".to_string(),
        })
    }

    pub async fn publish_task_update(&self, event: &TaskUpdateEvent) -> Result<()> {
        self.publish(keys::CHANNEL_TASK_UPDATES, &serde_json::to_string(event)?)
            .await
    }

    pub async fn publish_sync_confirmation(&self, event: &SyncConfirmation) -> Result<()> {
        self.publish(keys::CHANNEL_TASK_SYNC, &serde_json::to_string(event)?)
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.client.get_conn().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        debug!("Published message to channel {channel}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_update_events_are_tagged() {
        let event = TaskUpdateEvent::RemoteEdit {
            agent_id: "t1".to_string(),
            remote_id: "R1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"remote_edit\""));

        let parsed: TaskUpdateEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, TaskUpdateEvent::RemoteEdit { .. }));
    }

    #[test]
    fn unknown_announcements_still_parse_as_signal() {
        // Agents may publish free-form strings; the listener degrades to an
        // anonymous signal rather than dropping the wakeup.
        let err = serde_json::from_str::<TaskUpdateEvent>("\"poke\"");
        assert!(err.is_err());
    }
}
