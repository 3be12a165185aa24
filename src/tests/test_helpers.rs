use crate::models::{AgentTask, TaskPriority, TaskStatus};
use crate::token::{TokenKind, TokenProvider};
use crate::Result;
use chrono::Utc;

/// Fixed bearers per kind, so mocks can assert which credential a request
/// carried.
pub struct StaticTokens;

pub const DELEGATED_BEARER: &str = "test-delegated-bearer";
pub const APPLICATION_BEARER: &str = "test-application-bearer";

#[async_trait::async_trait]
impl TokenProvider for StaticTokens {
    async fn bearer_for(&self, kind: TokenKind) -> Result<String> {
        Ok(match kind {
            TokenKind::Delegated => DELEGATED_BEARER.to_string(),
            TokenKind::Application => APPLICATION_BEARER.to_string(),
        })
    }

    async fn invalidate(&self, kind: TokenKind) -> Result<String> {
        self.bearer_for(kind).await
    }
}

pub fn agent_task(id: &str, title: &str) -> AgentTask {
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
        updated_at: Utc::now(),
        conversation_id: None,
        labels: Vec::new(),
        checklist_items: Vec::new(),
        source_list: "active_tasks".to_string(),
    }
}
