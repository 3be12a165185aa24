use super::test_helpers::agent_task;
use crate::adapter;
use crate::config::TieDirection;
use crate::models::{RemoteTask, TaskPriority, TaskStatus};
use crate::sync::download::remote_wins;
use chrono::{Duration, Utc};
use std::collections::HashMap;

/// An agent-created task maps onto the exact POST body the planner
/// expects.
#[test]
fn create_from_agent_produces_expected_wire_body() {
    let mut task = agent_task("A1", "Draft");
    task.priority = TaskPriority::High;
    task.due_date = "2025-12-01".to_string();

    let remote = adapter::to_remote(&task, "plan-default", "bucket-1", &HashMap::new()).unwrap();
    let body = serde_json::to_value(&remote).unwrap();

    assert_eq!(body["title"], "Draft");
    assert_eq!(body["percentComplete"], 0);
    assert_eq!(body["priority"], 3);
    assert_eq!(body["dueDateTime"], "2025-12-01T00:00:00Z");
    assert_eq!(body["planId"], "plan-default");
    // No identity or version fields leak into a create body.
    assert!(body.get("id").is_none());
    assert!(body.get("@odata.etag").is_none());
}

/// The race the grace window exists for. The agent edited at t, the
/// remote at t+8; the notification arrives after our own upload already
/// landed. Remote wins and the merged task keeps the remote's completion.
#[test]
fn remote_edit_race_lost_by_agent() {
    let t = Utc::now();
    let mut agent = agent_task("A1", "Draft");
    agent.status = TaskStatus::InProgress;
    agent.percent_complete = 0.5;
    agent.updated_at = t;
    agent.labels = vec!["writing".to_string()];

    let remote = RemoteTask {
        id: "R1".to_string(),
        title: "Draft".to_string(),
        percent_complete: 75,
        priority: 5,
        last_modified_date_time: Some(t + Duration::seconds(8)),
        ..Default::default()
    };

    assert!(remote_wins(
        agent.updated_at,
        remote.last_modified_date_time.unwrap(),
        30,
        TieDirection::Remote,
    ));

    let merged = adapter::to_agent(&remote, Some(&agent), &HashMap::new());
    assert_eq!(merged.percent_complete, 0.75);
    assert_eq!(merged.status, TaskStatus::InProgress);
    // Agent-owned fields survive the remote win.
    assert_eq!(merged.labels, vec!["writing".to_string()]);
    assert_eq!(merged.id, "A1");
}

/// Applying the same notification twice yields the same post-state as
/// applying it once.
#[test]
fn notification_application_is_idempotent() {
    let agent = agent_task("A1", "Draft");
    let remote = RemoteTask {
        id: "R1".to_string(),
        title: "Draft v2".to_string(),
        percent_complete: 25,
        priority: 1,
        last_modified_date_time: Some(Utc::now()),
        ..Default::default()
    };

    let once = adapter::to_agent(&remote, Some(&agent), &HashMap::new());
    let twice = adapter::to_agent(&remote, Some(&once), &HashMap::new());

    assert_eq!(once, twice);
}

/// The update patch built from a diffed field set survives a round trip
/// through the operation descriptor's JSON form.
#[test]
fn patch_fields_survive_descriptor_serialization() {
    use crate::models::{OpKind, OperationDescriptor};

    let mut fields = serde_json::Map::new();
    fields.insert("title".to_string(), serde_json::Value::Bool(true));
    fields.insert("percent_complete".to_string(), serde_json::Value::Bool(true));

    let op = OperationDescriptor::new(OpKind::Update, "A1", TaskPriority::Urgent)
        .with_remote_id("R1")
        .with_fields(fields);

    let json = serde_json::to_string(&op).unwrap();
    let parsed: OperationDescriptor = serde_json::from_str(&json).unwrap();

    let field_names: Vec<&String> = parsed.fields.as_ref().unwrap().keys().collect();
    assert_eq!(field_names.len(), 2);

    let mut task = agent_task("A1", "Renamed");
    task.percent_complete = 0.4;
    let names: Vec<String> = parsed.fields.unwrap().keys().cloned().collect();
    let patch = adapter::remote_patch_for_fields(&task, &names, &HashMap::new());

    assert_eq!(patch["title"], serde_json::json!("Renamed"));
    assert_eq!(patch["percentComplete"], serde_json::json!(40));
}

/// A remote-origin task translated to agent shape and back preserves the
/// planner-visible fields.
#[test]
fn remote_origin_task_round_trips() {
    let remote = RemoteTask {
        id: "R9".to_string(),
        title: "Human task".to_string(),
        notes: "From the planner board".to_string(),
        percent_complete: 50,
        priority: 9,
        due_date_time: Some("2025-11-05T12:00:00Z".to_string()),
        plan_id: "p1".to_string(),
        bucket_id: "b2".to_string(),
        ..Default::default()
    };

    let agent = adapter::to_agent(&remote, None, &HashMap::new());
    assert_eq!(agent.source_list, adapter::REMOTE_ORIGIN_LIST);
    assert_eq!(agent.status, TaskStatus::InProgress);
    assert_eq!(agent.priority, TaskPriority::Low);

    let back = adapter::to_remote(&agent, "p1", "b2", &HashMap::new()).unwrap();
    assert_eq!(back.title, remote.title);
    assert_eq!(back.notes, remote.notes);
    assert_eq!(back.percent_complete, remote.percent_complete);
    assert_eq!(back.priority, remote.priority);
    assert_eq!(back.due_date_time, remote.due_date_time);
}
