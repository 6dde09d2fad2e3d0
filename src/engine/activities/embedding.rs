// Embedding activity: produce a vector for prompt text and attach it to
// conversation blocks. The task's `extra` names the target:
//   {"block_id": N}        — embed the task content onto one block
//   {"conversation_id": N} — embed every text block still missing a vector
// With no target, the content is embedded and only the dimensionality is
// recorded (used by health checks).

use super::Activity;
use crate::atoms::error::DaemonResult;
use crate::atoms::types::TaskRecord;
use crate::engine::state::DaemonState;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub struct EmbeddingActivity;

#[async_trait]
impl Activity for EmbeddingActivity {
    fn task_type(&self) -> &'static str {
        "embedding"
    }

    async fn execute(&self, state: &Arc<DaemonState>, task: &TaskRecord) -> DaemonResult<String> {
        if let Some(block_id) = task.extra["block_id"].as_i64() {
            let vector = state.embedder.embed(&task.description).await?;
            state.store.set_block_embedding(block_id, &vector)?;
            info!(
                "[activity] Embedded block {block_id} ({} dims)",
                vector.len()
            );
            return Ok(format!("embedded block {block_id} ({} dims)", vector.len()));
        }

        if let Some(conversation_id) = task.extra["conversation_id"].as_i64() {
            let pending = state.store.text_block_ids_without_embedding(conversation_id)?;
            let mut embedded = 0usize;
            let mut dims = 0usize;
            for (block_id, content) in pending {
                let vector = state.embedder.embed(&content).await?;
                dims = vector.len();
                state.store.set_block_embedding(block_id, &vector)?;
                embedded += 1;
            }
            info!(
                "[activity] Embedded {embedded} blocks of conversation {conversation_id}"
            );
            return Ok(format!("embedded {embedded} blocks ({dims} dims)"));
        }

        let vector = state.embedder.embed(&task.description).await?;
        Ok(format!("embedded content ({} dims)", vector.len()))
    }
}
