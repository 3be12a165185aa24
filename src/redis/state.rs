//! Conscious-state document access.
//!
//! The agent runtime owns two document families: the global state at
//! `agent_state/global` (named task lists under `$.task_lists`) and one
//! document per conversation at `agent_state/conv/{cid}` (a `$.tasks`
//! array). Tasks are plain id-keyed records; the nesting is only a
//! projection, so every write here is JSONPath-scoped to the owning list and
//! never rewrites a whole document.

use super::{keys, RedisClient};
use crate::models::AgentTask;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// List tasks from the planner land in when they have no prior agent-side home.
pub const PLANNER_SYNC_LIST: &str = "planner_sync";

/// Where a task lives inside the conscious state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLocation {
    /// Redis key of the owning document.
    pub doc_key: String,
    /// Name of the owning list inside the document.
    pub list: String,
    /// Index within the list array.
    pub index: usize,
    pub conversation_id: Option<String>,
}

impl TaskLocation {
    /// JSONPath to the task record itself.
    pub fn task_path(&self) -> String {
        if self.conversation_id.is_some() {
            format!("$.tasks[{}]", self.index)
        } else {
            format!("$.task_lists[\"{}\"][{}]", self.list, self.index)
        }
    }

    /// JSONPath to the owning list array.
    pub fn list_path(&self) -> String {
        if self.conversation_id.is_some() {
            "$.tasks".to_string()
        } else {
            format!("$.task_lists[\"{}\"]", self.list)
        }
    }
}

#[derive(Clone)]
pub struct StateStore {
    client: RedisClient,
}

impl StateStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Enumerate every task in the agent's universe: all named lists of the
    /// global document plus every per-conversation sub-tree. This is the
    /// bulk-snapshot path the drift detector runs on.
    pub async fn all_tasks(&self) -> Result<Vec<(TaskLocation, AgentTask)>> {
        let mut out = Vec::new();

        let lists: Option<HashMap<String, Vec<Value>>> =
            self.client.json_get(keys::STATE_GLOBAL, "$.task_lists").await?;
        if let Some(lists) = lists {
            for (list, entries) in lists {
                for (index, raw) in entries.into_iter().enumerate() {
                    match serde_json::from_value::<AgentTask>(raw) {
                        Ok(task) => out.push((
                            TaskLocation {
                                doc_key: keys::STATE_GLOBAL.to_string(),
                                list: list.clone(),
                                index,
                                conversation_id: None,
                            },
                            task,
                        )),
                        Err(e) => {
                            // A half-written record must not poison the scan;
                            // the next drift pass sees the completed write.
                            warn!("Skipping malformed task in list '{list}': {e}");
                        }
                    }
                }
            }
        }

        for cid in self.conversation_ids().await? {
            let doc_key = keys::conv_state(&cid);
            let tasks: Option<Vec<Value>> = self.client.json_get(&doc_key, "$.tasks").await?;
            if let Some(tasks) = tasks {
                for (index, raw) in tasks.into_iter().enumerate() {
                    match serde_json::from_value::<AgentTask>(raw) {
                        Ok(task) => out.push((
                            TaskLocation {
                                doc_key: doc_key.clone(),
                                list: "tasks".to_string(),
                                index,
                                conversation_id: Some(cid.clone()),
                            },
                            task,
                        )),
                        Err(e) => warn!("Skipping malformed task in conversation '{cid}': {e}"),
                    }
                }
            }
        }

        Ok(out)
    }

    /// SCAN for per-conversation documents.
    pub async fn conversation_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.client.get_conn().await?;
        let mut ids = Vec::new();
        let mut cursor: u64 = 0;
        let pattern = format!("{}*", keys::STATE_CONV_PREFIX);
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            for key in batch {
                if let Some(cid) = key.strip_prefix(keys::STATE_CONV_PREFIX) {
                    ids.push(cid.to_string());
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(ids)
    }

    /// Locate a task by agent id across the whole universe.
    pub async fn find_task(&self, agent_id: &str) -> Result<Option<(TaskLocation, AgentTask)>> {
        Ok(self
            .all_tasks()
            .await?
            .into_iter()
            .find(|(_, task)| task.id == agent_id))
    }

    /// Insert a brand-new task (remote-origin creation) into the configured
    /// landing list of the global document, creating the scaffolding on
    /// first use. Also mirrors to `tasks/{agent_id}`.
    pub async fn insert_task(&self, task: &AgentTask) -> Result<TaskLocation> {
        let list = if task.source_list.is_empty() {
            PLANNER_SYNC_LIST.to_string()
        } else {
            task.source_list.clone()
        };

        // Create document root and list if absent. NX-style: JSON.SET with
        // an empty-object fallback would clobber, so probe first.
        let root: Option<Value> = self.client.json_get(keys::STATE_GLOBAL, "$").await?;
        if root.is_none() {
            self.client
                .json_set(
                    keys::STATE_GLOBAL,
                    "$",
                    &serde_json::json!({ "task_lists": {} }),
                )
                .await?;
        }
        let list_path = format!("$.task_lists[\"{list}\"]");
        let existing: Option<Vec<Value>> =
            self.client.json_get(keys::STATE_GLOBAL, &list_path).await?;
        let index = match existing {
            Some(entries) => {
                self.client
                    .json_arr_append(keys::STATE_GLOBAL, &list_path, task)
                    .await?;
                entries.len()
            }
            None => {
                self.client
                    .json_set(keys::STATE_GLOBAL, &list_path, &vec![task])
                    .await?;
                0
            }
        };

        self.mirror_task(task).await?;
        debug!("Inserted task {} into list '{list}'", task.id);

        Ok(TaskLocation {
            doc_key: keys::STATE_GLOBAL.to_string(),
            list,
            index,
            conversation_id: None,
        })
    }

    /// Replace a task record in place.
    pub async fn replace_task(&self, location: &TaskLocation, task: &AgentTask) -> Result<()> {
        self.client
            .json_set(&location.doc_key, &location.task_path(), task)
            .await?;
        self.mirror_task(task).await
    }

    /// Patch selected fields of a task record. Field-scoped writes keep
    /// concurrent agent edits to other fields intact.
    pub async fn patch_task_fields(
        &self,
        location: &TaskLocation,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let base = location.task_path();
        for (field, value) in fields {
            let path = format!("{base}.{field}");
            self.client.json_set(&location.doc_key, &path, value).await?;
        }
        Ok(())
    }

    /// Remove a task record from its list and drop the canonical mirror.
    pub async fn remove_task(&self, location: &TaskLocation, agent_id: &str) -> Result<()> {
        self.client
            .json_del(&location.doc_key, &location.task_path())
            .await?;
        let mut conn = self.client.get_conn().await?;
        redis::cmd("DEL")
            .arg(keys::task(agent_id))
            .query_async::<()>(&mut conn)
            .await?;
        debug!("Removed task {agent_id} from {}", location.doc_key);
        Ok(())
    }

    /// Keep the per-task canonical copy at `tasks/{agent_id}` in step with
    /// the embedded form.
    pub async fn mirror_task(&self, task: &AgentTask) -> Result<()> {
        self.client.json_set(&keys::task(&task.id), "$", task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_paths_are_list_scoped() {
        let global = TaskLocation {
            doc_key: keys::STATE_GLOBAL.to_string(),
            list: "active_tasks".to_string(),
            index: 3,
            conversation_id: None,
        };
        assert_eq!(global.task_path(), "$.task_lists[\"active_tasks\"][3]");
        assert_eq!(global.list_path(), "$.task_lists[\"active_tasks\"]");

        let conv = TaskLocation {
            doc_key: keys::conv_state("c1"),
            list: "tasks".to_string(),
            index: 0,
            conversation_id: Some("c1".to_string()),
        };
        assert_eq!(conv.task_path(), "$.tasks[0]");
        assert_eq!(conv.list_path(), "$.tasks");
    }
}
