//! Pure translation between the agent-native task shape and the planner's
//! flat task shape. No I/O here: the sync pipelines own all side effects.
//!
//! The priority integers are the planner's convention and are treated as
//! opaque table entries in both directions. Do not do arithmetic on them.

use crate::models::{
    AgentTask, RemoteAssignment, RemoteTask, TaskPriority, TaskStatus,
};
use crate::{BridgeError, Result};
use chrono::Utc;
use std::collections::HashMap;

/// List tasks from the planner land in when no prior agent task exists.
pub const REMOTE_ORIGIN_LIST: &str = "planner_sync";

/// Agent priority → planner priority integer.
pub const PRIORITY_TO_REMOTE: [(TaskPriority, u8); 4] = [
    (TaskPriority::Urgent, 1),
    (TaskPriority::High, 3),
    (TaskPriority::Normal, 5),
    (TaskPriority::Low, 9),
];

pub fn priority_to_remote(priority: TaskPriority) -> u8 {
    PRIORITY_TO_REMOTE
        .iter()
        .find(|(p, _)| *p == priority)
        .map(|(_, n)| *n)
        .unwrap_or(5)
}

/// Planner priority integer → agent priority, banded with tie rules.
pub fn priority_to_agent(remote: u8) -> TaskPriority {
    match remote {
        0..=2 => TaskPriority::Urgent,
        3 => TaskPriority::High,
        4..=6 => TaskPriority::Normal,
        _ => TaskPriority::Low,
    }
}

/// Normalize an agent `due_date` into the planner's `dueDateTime` form.
/// Bare dates become midnight UTC; datetimes pass through, gaining a `Z`
/// only when no suffix is present. Empty input means "no due date".
pub fn normalize_due_date(due_date: &str) -> Option<String> {
    let trimmed = due_date.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('T') {
        if trimmed.ends_with('Z') || trimmed.contains('+') {
            Some(trimmed.to_string())
        } else {
            Some(format!("{trimmed}Z"))
        }
    } else {
        Some(format!("{trimmed}T00:00:00Z"))
    }
}

/// Derive the agent status from the planner's completion percentage.
pub fn status_from_percent(percent_complete: u8) -> TaskStatus {
    match percent_complete {
        0 => TaskStatus::NotStarted,
        100 => TaskStatus::Completed,
        _ => TaskStatus::InProgress,
    }
}

/// Translate an agent task into the planner shape for a create.
///
/// Labels, checklist items, source list and conversation id are agent-owned
/// and deliberately not forwarded; the planner maintains its own versions of
/// the first two.
pub fn to_remote(
    task: &AgentTask,
    plan_id: &str,
    bucket_id: &str,
    user_id_map: &HashMap<String, String>,
) -> Result<RemoteTask> {
    if task.title.trim().is_empty() {
        return Err(BridgeError::Validation(format!(
            "task {} has an empty title",
            task.id
        )));
    }

    let mut assignments = HashMap::new();
    if !task.assigned_to.is_empty() {
        if let Some(remote_user) = user_id_map.get(&task.assigned_to) {
            assignments.insert(remote_user.clone(), RemoteAssignment::new());
        }
    }

    Ok(RemoteTask {
        id: String::new(),
        title: task.title.clone(),
        notes: task.description.clone(),
        plan_id: plan_id.to_string(),
        bucket_id: bucket_id.to_string(),
        assignments,
        percent_complete: percent_to_remote(task.percent_complete),
        priority: priority_to_remote(task.priority),
        due_date_time: normalize_due_date(&task.due_date),
        etag: String::new(),
        last_modified_date_time: None,
    })
}

/// Fractional completion → integer percentage, clamped to [0, 100].
pub fn percent_to_remote(percent_complete: f64) -> u8 {
    (percent_complete * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Translate a planner task into the agent shape.
///
/// When `existing` is given (an update to a known agent task), agent-owned
/// fields are preserved from it; otherwise this is a remote-origin creation
/// and the task gets a fresh agent id in the configured landing list.
pub fn to_agent(
    remote: &RemoteTask,
    existing: Option<&AgentTask>,
    user_id_map: &HashMap<String, String>,
) -> AgentTask {
    let inverse: HashMap<&String, &String> =
        user_id_map.iter().map(|(k, v)| (v, k)).collect();

    let assigned_to = remote
        .assignments
        .keys()
        .next()
        .and_then(|remote_user| inverse.get(remote_user).map(|s| s.to_string()))
        .unwrap_or_default();

    let now = Utc::now();
    let updated_at = remote.last_modified_date_time.unwrap_or(now);

    match existing {
        Some(agent) => AgentTask {
            id: agent.id.clone(),
            title: remote.title.clone(),
            description: remote.notes.clone(),
            status: status_from_percent(remote.percent_complete),
            percent_complete: remote.percent_complete as f64 / 100.0,
            priority: priority_to_agent(remote.priority),
            assigned_to,
            due_date: remote.due_date_time.clone().unwrap_or_default(),
            created_at: agent.created_at,
            updated_at,
            conversation_id: agent.conversation_id.clone(),
            labels: agent.labels.clone(),
            checklist_items: agent.checklist_items.clone(),
            source_list: agent.source_list.clone(),
        },
        None => AgentTask {
            id: uuid::Uuid::new_v4().to_string(),
            title: remote.title.clone(),
            description: remote.notes.clone(),
            status: status_from_percent(remote.percent_complete),
            percent_complete: remote.percent_complete as f64 / 100.0,
            priority: priority_to_agent(remote.priority),
            assigned_to,
            due_date: remote.due_date_time.clone().unwrap_or_default(),
            created_at: now,
            updated_at,
            conversation_id: None,
            labels: Vec::new(),
            checklist_items: Vec::new(),
            source_list: REMOTE_ORIGIN_LIST.to_string(),
        },
    }
}

/// Build the planner PATCH body for a set of changed agent-side fields.
/// Only fields the diff flagged are included, so an update never clobbers a
/// concurrent human edit to an untouched field.
pub fn remote_patch_for_fields(
    task: &AgentTask,
    changed_fields: &[String],
    user_id_map: &HashMap<String, String>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut patch = serde_json::Map::new();
    for field in changed_fields {
        match field.as_str() {
            "title" => {
                patch.insert("title".to_string(), task.title.clone().into());
            }
            "description" => {
                patch.insert("notes".to_string(), task.description.clone().into());
            }
            "percent_complete" | "status" => {
                patch.insert(
                    "percentComplete".to_string(),
                    percent_to_remote(effective_percent(task)).into(),
                );
            }
            "priority" => {
                patch.insert(
                    "priority".to_string(),
                    priority_to_remote(task.priority).into(),
                );
            }
            "due_date" => {
                patch.insert(
                    "dueDateTime".to_string(),
                    match normalize_due_date(&task.due_date) {
                        Some(v) => v.into(),
                        None => serde_json::Value::Null,
                    },
                );
            }
            "assigned_to" => {
                let mut assignments = serde_json::Map::new();
                if let Some(remote_user) = user_id_map.get(&task.assigned_to) {
                    assignments.insert(
                        remote_user.clone(),
                        serde_json::to_value(RemoteAssignment::new())
                            .unwrap_or(serde_json::Value::Null),
                    );
                }
                patch.insert("assignments".to_string(), assignments.into());
            }
            // Agent-owned fields never cross the wire.
            _ => {}
        }
    }
    patch
}

/// Completion status and fraction can disagree transiently while an agent is
/// mid-edit; a completed status forces 100.
fn effective_percent(task: &AgentTask) -> f64 {
    if task.status == TaskStatus::Completed {
        1.0
    } else {
        task.percent_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChecklistItem;

    fn sample_task() -> AgentTask {
        AgentTask {
            id: "A1".to_string(),
            title: "Draft".to_string(),
            description: "Write the draft".to_string(),
            status: TaskStatus::NotStarted,
            percent_complete: 0.0,
            priority: TaskPriority::High,
            assigned_to: "scout".to_string(),
            due_date: "2025-12-01".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            conversation_id: None,
            labels: vec!["writing".to_string()],
            checklist_items: vec![ChecklistItem {
                text: "outline".to_string(),
                checked: false,
            }],
            source_list: "active_tasks".to_string(),
        }
    }

    fn user_map() -> HashMap<String, String> {
        HashMap::from([("scout".to_string(), "remote-u1".to_string())])
    }

    #[test]
    fn priority_tables_round_trip() {
        for priority in [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::High,
            TaskPriority::Urgent,
        ] {
            assert_eq!(priority_to_agent(priority_to_remote(priority)), priority);
        }
        assert_eq!(priority_to_remote(TaskPriority::Urgent), 1);
        assert_eq!(priority_to_remote(TaskPriority::High), 3);
        assert_eq!(priority_to_remote(TaskPriority::Normal), 5);
        assert_eq!(priority_to_remote(TaskPriority::Low), 9);
    }

    #[test]
    fn priority_bands_cover_the_remote_range() {
        assert_eq!(priority_to_agent(2), TaskPriority::Urgent);
        assert_eq!(priority_to_agent(4), TaskPriority::Normal);
        assert_eq!(priority_to_agent(6), TaskPriority::Normal);
        assert_eq!(priority_to_agent(7), TaskPriority::Low);
        assert_eq!(priority_to_agent(10), TaskPriority::Low);
    }

    #[test]
    fn bare_due_date_becomes_midnight_utc() {
        assert_eq!(
            normalize_due_date("2025-10-24").as_deref(),
            Some("2025-10-24T00:00:00Z")
        );
    }

    #[test]
    fn datetime_due_date_passes_through() {
        assert_eq!(
            normalize_due_date("2025-10-24T23:00:00Z").as_deref(),
            Some("2025-10-24T23:00:00Z")
        );
        // Missing suffix gains a Z without duplication.
        assert_eq!(
            normalize_due_date("2025-10-24T23:00:00").as_deref(),
            Some("2025-10-24T23:00:00Z")
        );
    }

    #[test]
    fn empty_due_date_is_omitted() {
        assert_eq!(normalize_due_date(""), None);
        assert_eq!(normalize_due_date("   "), None);
    }

    #[test]
    fn tiny_completion_rounds_up_to_one() {
        assert_eq!(percent_to_remote(0.005), 1);
        assert_eq!(percent_to_remote(0.0), 0);
        assert_eq!(percent_to_remote(1.0), 100);
        // Out-of-range agent values clamp instead of wrapping.
        assert_eq!(percent_to_remote(1.5), 100);
        assert_eq!(percent_to_remote(-0.1), 0);
    }

    #[test]
    fn to_remote_maps_the_s1_create() {
        let task = sample_task();
        let remote = to_remote(&task, "plan-1", "bucket-1", &user_map()).unwrap();

        assert_eq!(remote.title, "Draft");
        assert_eq!(remote.percent_complete, 0);
        assert_eq!(remote.priority, 3);
        assert_eq!(remote.due_date_time.as_deref(), Some("2025-12-01T00:00:00Z"));
        assert_eq!(remote.plan_id, "plan-1");
        assert_eq!(remote.bucket_id, "bucket-1");
        assert!(remote.assignments.contains_key("remote-u1"));
    }

    #[test]
    fn to_remote_rejects_empty_title() {
        let mut task = sample_task();
        task.title = "  ".to_string();
        assert!(to_remote(&task, "p", "b", &HashMap::new()).is_err());
    }

    #[test]
    fn unknown_assignee_yields_no_assignment() {
        let mut task = sample_task();
        task.assigned_to = "stranger".to_string();
        let remote = to_remote(&task, "p", "b", &user_map()).unwrap();
        assert!(remote.assignments.is_empty());
    }

    #[test]
    fn to_agent_derives_status_from_percent() {
        let mut remote = RemoteTask {
            title: "Draft".to_string(),
            percent_complete: 0,
            priority: 5,
            ..Default::default()
        };
        assert_eq!(
            to_agent(&remote, None, &HashMap::new()).status,
            TaskStatus::NotStarted
        );
        remote.percent_complete = 75;
        assert_eq!(
            to_agent(&remote, None, &HashMap::new()).status,
            TaskStatus::InProgress
        );
        remote.percent_complete = 100;
        assert_eq!(
            to_agent(&remote, None, &HashMap::new()).status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn to_agent_preserves_agent_owned_fields_on_update() {
        let existing = sample_task();
        let remote = RemoteTask {
            id: "R1".to_string(),
            title: "Draft v2".to_string(),
            percent_complete: 50,
            priority: 1,
            ..Default::default()
        };

        let merged = to_agent(&remote, Some(&existing), &user_map());
        assert_eq!(merged.id, "A1");
        assert_eq!(merged.title, "Draft v2");
        assert_eq!(merged.priority, TaskPriority::Urgent);
        assert_eq!(merged.labels, existing.labels);
        assert_eq!(merged.checklist_items, existing.checklist_items);
        assert_eq!(merged.source_list, "active_tasks");
        assert_eq!(merged.created_at, existing.created_at);
    }

    #[test]
    fn remote_origin_creation_lands_in_planner_sync() {
        let remote = RemoteTask {
            id: "R9".to_string(),
            title: "Human task".to_string(),
            percent_complete: 0,
            priority: 5,
            ..Default::default()
        };
        let agent = to_agent(&remote, None, &HashMap::new());
        assert_eq!(agent.source_list, REMOTE_ORIGIN_LIST);
        assert!(!agent.id.is_empty());
        assert!(agent.labels.is_empty());
    }

    #[test]
    fn round_trip_modulo_unforwarded_fields() {
        let task = sample_task();
        let remote = to_remote(&task, "plan-1", "bucket-1", &user_map()).unwrap();
        let back = to_agent(&remote, Some(&task), &user_map());

        assert_eq!(back.title, task.title);
        assert_eq!(back.description, task.description);
        assert_eq!(back.priority, task.priority);
        assert_eq!(back.assigned_to, task.assigned_to);
        // Bare date normalized on the way out; kept in normalized form.
        assert_eq!(back.due_date, "2025-12-01T00:00:00Z");
        // Status derives from percent, which is the documented exception.
        assert_eq!(back.status, TaskStatus::NotStarted);
        // Unforwarded fields come from the agent side untouched.
        assert_eq!(back.labels, task.labels);
        assert_eq!(back.checklist_items, task.checklist_items);
    }

    #[test]
    fn patch_includes_only_changed_fields() {
        let task = sample_task();
        let patch = remote_patch_for_fields(
            &task,
            &["title".to_string(), "due_date".to_string()],
            &user_map(),
        );

        assert_eq!(patch.len(), 2);
        assert_eq!(patch["title"], serde_json::json!("Draft"));
        assert_eq!(patch["dueDateTime"], serde_json::json!("2025-12-01T00:00:00Z"));
    }

    #[test]
    fn patch_ignores_agent_owned_fields() {
        let task = sample_task();
        let patch = remote_patch_for_fields(
            &task,
            &["labels".to_string(), "checklist_items".to_string()],
            &user_map(),
        );
        assert!(patch.is_empty());
    }

    #[test]
    fn completed_status_forces_full_percent_in_patch() {
        let mut task = sample_task();
        task.status = TaskStatus::Completed;
        task.percent_complete = 0.5;
        let patch = remote_patch_for_fields(&task, &["status".to_string()], &HashMap::new());
        assert_eq!(patch["percentComplete"], serde_json::json!(100));
    }

    #[test]
    fn cleared_due_date_patches_to_null() {
        let mut task = sample_task();
        task.due_date = String::new();
        let patch = remote_patch_for_fields(&task, &["due_date".to_string()], &HashMap::new());
        assert_eq!(patch["dueDateTime"], serde_json::Value::Null);
    }
}
