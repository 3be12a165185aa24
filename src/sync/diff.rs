//! Snapshot diffing for the upload pipeline.
//!
//! Given the current agent task universe and the per-task sync sidecars,
//! produce the minimal edit set: creates for unmapped tasks, field-scoped
//! updates for mapped tasks edited since their last upload, and deletes for
//! mapped tasks that have disappeared. Disappearances only count after two
//! consecutive observations, so a partially written document read mid-update
//! cannot masquerade as a deletion.

use crate::models::AgentTask;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Fields the upload pipeline syncs. Order is the comparison order; names
/// are the agent-side field names the adapter understands.
const SYNCED_FIELDS: &[&str] = &[
    "title",
    "description",
    "status",
    "percent_complete",
    "priority",
    "due_date",
    "assigned_to",
];

/// Agent-side field names that differ between two versions of a task.
pub fn changed_fields(current: &AgentTask, baseline: &AgentTask) -> Vec<String> {
    let mut changed = Vec::new();
    for field in SYNCED_FIELDS {
        let differs = match *field {
            "title" => current.title != baseline.title,
            "description" => current.description != baseline.description,
            "status" => current.status != baseline.status,
            "percent_complete" => {
                (current.percent_complete - baseline.percent_complete).abs() > f64::EPSILON
            }
            "priority" => current.priority != baseline.priority,
            "due_date" => current.due_date != baseline.due_date,
            "assigned_to" => current.assigned_to != baseline.assigned_to,
            _ => false,
        };
        if differs {
            changed.push(field.to_string());
        }
    }
    changed
}

/// The create/update half of the minimal edit set one diff pass produced.
/// Deletes flow through [`DeleteDetector`] because they need cross-pass
/// memory.
#[derive(Debug, Default)]
pub struct DiffOutcome {
    pub creates: Vec<AgentTask>,
    /// Task plus the agent-side names of the fields that changed.
    pub updates: Vec<(AgentTask, Vec<String>)>,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty()
    }
}

/// Two-strike disappearance tracking. A mapped task missing from the
/// universe becomes a delete only when it was already missing at least one
/// full drift interval earlier.
#[derive(Debug, Default)]
pub struct DeleteDetector {
    first_missed: HashMap<String, Instant>,
}

impl DeleteDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this pass's missing set; returns the ids whose disappearance
    /// is now confirmed.
    pub fn observe(
        &mut self,
        missing_now: &HashSet<String>,
        min_gap: Duration,
    ) -> Vec<String> {
        // A task that reappeared clears its strike.
        self.first_missed.retain(|id, _| missing_now.contains(id));

        let mut confirmed = Vec::new();
        let now = Instant::now();
        for id in missing_now {
            match self.first_missed.get(id) {
                Some(first) if now.duration_since(*first) >= min_gap => {
                    confirmed.push(id.clone());
                }
                Some(_) => {}
                None => {
                    self.first_missed.insert(id.clone(), now);
                }
            }
        }
        for id in &confirmed {
            self.first_missed.remove(id);
        }
        confirmed
    }
}

/// Inputs the diff needs beyond the universe itself, all read from Redis by
/// the caller so this stays pure and testable.
pub struct DiffInputs {
    /// agent_id → remote_id for every bound task.
    pub mappings: HashMap<String, String>,
    /// agent_id → unix seconds of the last successful push.
    pub last_uploads: HashMap<String, i64>,
    /// agent_id → last-synced agent-shape baseline (cached remote snapshot
    /// translated back), used for field-level change detection.
    pub baselines: HashMap<String, AgentTask>,
}

/// Compute creates and updates for one pass.
pub fn compute_edits(universe: &[AgentTask], inputs: &DiffInputs) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();

    for task in universe {
        match inputs.mappings.get(&task.id) {
            None => outcome.creates.push(task.clone()),
            Some(_remote_id) => {
                // Only tasks edited since their last push are candidates;
                // this suppresses echoes of our own write-backs.
                let last_upload = inputs.last_uploads.get(&task.id).copied().unwrap_or(0);
                if task.updated_at.timestamp() <= last_upload {
                    continue;
                }
                let fields = match inputs.baselines.get(&task.id) {
                    Some(baseline) => changed_fields(task, baseline),
                    // No baseline to compare against: resend everything.
                    None => SYNCED_FIELDS.iter().map(|f| f.to_string()).collect(),
                };
                if !fields.is_empty() {
                    outcome.updates.push((task.clone(), fields));
                }
            }
        }
    }

    outcome
}

/// The mapped agent ids absent from the universe this pass.
pub fn missing_mapped_ids(
    universe: &[AgentTask],
    mappings: &HashMap<String, String>,
) -> HashSet<String> {
    let present: HashSet<&str> = universe.iter().map(|t| t.id.as_str()).collect();
    mappings
        .keys()
        .filter(|agent_id| !present.contains(agent_id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskPriority, TaskStatus};
    use chrono::Utc;

    fn task(id: &str, title: &str, updated_unix: i64) -> AgentTask {
        AgentTask {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            status: TaskStatus::NotStarted,
            percent_complete: 0.0,
            priority: TaskPriority::Normal,
            assigned_to: String::new(),
            due_date: String::new(),
            created_at: Utc::now(),
            updated_at: chrono::DateTime::from_timestamp(updated_unix, 0).unwrap(),
            conversation_id: None,
            labels: Vec::new(),
            checklist_items: Vec::new(),
            source_list: "active_tasks".to_string(),
        }
    }

    #[test]
    fn unmapped_tasks_become_creates() {
        let universe = vec![task("t1", "New", 100)];
        let inputs = DiffInputs {
            mappings: HashMap::new(),
            last_uploads: HashMap::new(),
            baselines: HashMap::new(),
        };
        let outcome = compute_edits(&universe, &inputs);
        assert_eq!(outcome.creates.len(), 1);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn unedited_mapped_tasks_are_skipped() {
        let universe = vec![task("t1", "Same", 100)];
        let inputs = DiffInputs {
            mappings: HashMap::from([("t1".to_string(), "R1".to_string())]),
            last_uploads: HashMap::from([("t1".to_string(), 100)]),
            baselines: HashMap::new(),
        };
        let outcome = compute_edits(&universe, &inputs);
        assert!(outcome.is_empty());
    }

    #[test]
    fn edited_tasks_carry_only_changed_fields() {
        let mut current = task("t1", "Renamed", 200);
        current.percent_complete = 0.5;
        current.status = TaskStatus::InProgress;
        let baseline = task("t1", "Original", 100);

        let universe = vec![current];
        let inputs = DiffInputs {
            mappings: HashMap::from([("t1".to_string(), "R1".to_string())]),
            last_uploads: HashMap::from([("t1".to_string(), 100)]),
            baselines: HashMap::from([("t1".to_string(), baseline)]),
        };
        let outcome = compute_edits(&universe, &inputs);
        assert_eq!(outcome.updates.len(), 1);
        let (_, fields) = &outcome.updates[0];
        assert_eq!(
            fields,
            &vec![
                "title".to_string(),
                "status".to_string(),
                "percent_complete".to_string()
            ]
        );
    }

    #[test]
    fn missing_baseline_resends_all_fields() {
        let universe = vec![task("t1", "Edited", 200)];
        let inputs = DiffInputs {
            mappings: HashMap::from([("t1".to_string(), "R1".to_string())]),
            last_uploads: HashMap::from([("t1".to_string(), 100)]),
            baselines: HashMap::new(),
        };
        let outcome = compute_edits(&universe, &inputs);
        assert_eq!(outcome.updates[0].1.len(), SYNCED_FIELDS.len());
    }

    #[test]
    fn missing_mapped_ids_are_detected() {
        let universe = vec![task("t1", "Here", 100)];
        let mappings = HashMap::from([
            ("t1".to_string(), "R1".to_string()),
            ("t2".to_string(), "R2".to_string()),
        ]);
        let missing = missing_mapped_ids(&universe, &mappings);
        assert_eq!(missing, HashSet::from(["t2".to_string()]));
    }

    #[test]
    fn delete_needs_two_strikes() {
        let mut detector = DeleteDetector::new();
        let missing = HashSet::from(["t2".to_string()]);

        // First observation arms the strike but confirms nothing.
        assert!(detector.observe(&missing, Duration::ZERO).is_empty());
        // Second observation past the gap confirms.
        assert_eq!(detector.observe(&missing, Duration::ZERO), vec!["t2".to_string()]);
        // Confirmed ids are forgotten; a third pass re-arms.
        assert!(detector.observe(&missing, Duration::ZERO).is_empty());
    }

    #[test]
    fn reappearance_clears_the_strike() {
        let mut detector = DeleteDetector::new();
        let missing = HashSet::from(["t2".to_string()]);
        assert!(detector.observe(&missing, Duration::ZERO).is_empty());

        // The task shows up again (mid-write misread); the strike resets.
        assert!(detector.observe(&HashSet::new(), Duration::ZERO).is_empty());
        assert!(detector.observe(&missing, Duration::ZERO).is_empty());
    }

    #[test]
    fn strike_respects_minimum_gap() {
        let mut detector = DeleteDetector::new();
        let missing = HashSet::from(["t2".to_string()]);
        assert!(detector.observe(&missing, Duration::from_secs(60)).is_empty());
        // Immediately re-observed: the gap has not elapsed.
        assert!(detector.observe(&missing, Duration::from_secs(60)).is_empty());
    }
}
