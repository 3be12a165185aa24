use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// A task as it lives inside the agent's conscious-state document.
///
/// This is the agent-native shape: nested under named task lists, agent-owned
/// id, fractional completion, free-form assignee. The adapter translates it
/// to and from the planner's flat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub percent_complete: f64,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub due_date: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub checklist_items: Vec<ChecklistItem>,
    #[serde(default)]
    pub source_list: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub text: String,
    #[serde(default)]
    pub checked: bool,
}

/// Agent-side task status vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

/// Agent-side task priority vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// A task as consumed from and produced for the planner's HTTP API.
///
/// camelCase on the wire. The etag rides in the body on fetches
/// (`@odata.etag`) and is echoed through `If-Match` on conditional writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteTask {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plan_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bucket_id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub assignments: HashMap<String, RemoteAssignment>,
    pub percent_complete: u8,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date_time: Option<String>,
    #[serde(rename = "@odata.etag", skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAssignment {
    #[serde(rename = "@odata.type")]
    pub odata_type: String,
    pub order_hint: String,
}

impl RemoteAssignment {
    pub fn new() -> Self {
        Self {
            odata_type: "#externalPlanner.assignment".to_string(),
            order_hint: " !".to_string(),
        }
    }
}

impl Default for RemoteAssignment {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of mutation an upload operation performs against the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// One queued upload operation, serialized as JSON into `pending_ops`.
///
/// Updates carry only the fields that changed since last upload; the worker
/// rebuilds the patch body from them at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub kind: OpKind,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub priority: TaskPriority,
}

impl OperationDescriptor {
    pub fn new(kind: OpKind, agent_id: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            remote_id: None,
            fields: None,
            attempt: 0,
            enqueued_at: Utc::now(),
            priority,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_fields(mut self, fields: serde_json::Map<String, serde_json::Value>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// One structured entry in the trimmed diagnostic sync log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub at: DateTime<Utc>,
    pub event: SyncEvent,
    pub agent_id: Option<String>,
    pub remote_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    Created,
    Updated,
    Deleted,
    RateLimited,
    ConflictRemoteWon,
    ConflictAgentWon,
    MappingTornDown,
    DemotedToConflict,
    OpFailed,
    SubscriptionChange,
}

impl SyncLogEntry {
    pub fn new(event: SyncEvent, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            event,
            agent_id: None,
            remote_id: None,
            detail: detail.into(),
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn remote(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_task_round_trips_through_json() {
        let task = AgentTask {
            id: "task-1".to_string(),
            title: "Draft".to_string(),
            description: "Write the draft".to_string(),
            status: TaskStatus::InProgress,
            percent_complete: 0.5,
            priority: TaskPriority::High,
            assigned_to: "scout".to_string(),
            due_date: "2025-12-01".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            conversation_id: Some("conv-9".to_string()),
            labels: vec!["writing".to_string()],
            checklist_items: vec![ChecklistItem {
                text: "outline".to_string(),
                checked: true,
            }],
            source_list: "active_tasks".to_string(),
        };

        let json = serde_json::to_string(&task).unwrap();
        let parsed: AgentTask = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn agent_task_tolerates_sparse_documents() {
        // Agents write minimal records; everything but id/title/status and
        // timestamps must default.
        let json = r#"{
            "id": "t1",
            "title": "Bare",
            "status": "not_started",
            "created_at": "2025-10-24T00:00:00Z",
            "updated_at": "2025-10-24T00:00:00Z"
        }"#;
        let task: AgentTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(task.labels.is_empty());
        assert!(task.due_date.is_empty());
        assert!(task.conversation_id.is_none());
    }

    #[test]
    fn remote_task_uses_camel_case_and_etag_rename() {
        let json = r#"{
            "id": "R1",
            "title": "Draft",
            "percentComplete": 50,
            "priority": 3,
            "planId": "p1",
            "bucketId": "b1",
            "@odata.etag": "W/\"abc\"",
            "dueDateTime": "2025-12-01T00:00:00Z"
        }"#;
        let task: RemoteTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.percent_complete, 50);
        assert_eq!(task.etag, "W/\"abc\"");
        assert_eq!(task.due_date_time.as_deref(), Some("2025-12-01T00:00:00Z"));
    }

    #[test]
    fn operation_descriptor_serializes_compactly() {
        let op = OperationDescriptor::new(OpKind::Delete, "t1", TaskPriority::Normal)
            .with_remote_id("R1");
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"delete\""));
        // No fields key for field-less ops.
        assert!(!json.contains("\"fields\""));

        let parsed: OperationDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, OpKind::Delete);
        assert_eq!(parsed.remote_id.as_deref(), Some("R1"));
        assert_eq!(parsed.attempt, 0);
    }
}
