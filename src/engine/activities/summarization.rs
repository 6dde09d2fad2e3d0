// Summarization activity: produce the session summary after a session
// ends or crosses the size threshold. Safe to re-execute — the summary
// row is an upsert keyed by session.

use super::Activity;
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::TaskRecord;
use crate::engine::state::DaemonState;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub struct SummarizationActivity;

#[async_trait]
impl Activity for SummarizationActivity {
    fn task_type(&self) -> &'static str {
        "summarization"
    }

    async fn execute(&self, state: &Arc<DaemonState>, task: &TaskRecord) -> DaemonResult<String> {
        if state.config.disable_summary {
            return Ok("skipped (summaries disabled)".into());
        }
        let session_id = task
            .session_id
            .or_else(|| task.extra["session_id"].as_i64())
            .ok_or_else(|| DaemonError::Validation("summarization task without session_id".into()))?;

        let conversations = state.store.conversations_for_session(session_id)?;
        if conversations.is_empty() {
            return Ok("nothing to summarize".into());
        }

        let transcript: String = conversations
            .iter()
            .map(|c| format!("[{}] {}", c.message_type, c.prompt))
            .collect::<Vec<_>>()
            .join("\n");
        let source_ids: Vec<i64> = conversations.iter().map(|c| c.id).collect();

        let summary = state
            .llm
            .summarize(&state.config.summary_model, &transcript)
            .await?;
        if summary.is_empty() {
            return Err(DaemonError::provider("llm", "empty summary", true));
        }
        state
            .store
            .upsert_session_summary(session_id, &summary, &source_ids)?;
        info!(
            "[activity] Summarized session {session_id} from {} conversations",
            source_ids.len()
        );
        Ok(format!("summarized session {session_id}"))
    }
}
