// ── dere engine: Activities ────────────────────────────────────────────────
// An activity is an individually retryable unit of work bound to a task
// type. Dispatch over task types goes through a registry populated at
// startup; a worker that claims a task with no registered activity marks
// it failed with a clear error instead of crashing.
//
// Idempotence contract: every activity takes its full input from the task
// row and writes results through the store in a way that is safe to
// re-execute (upserts, INSERT-once guarded by claim semantics).

mod embedding;
mod extraction;
mod summarization;

pub use embedding::EmbeddingActivity;
pub use extraction::EntityExtractionActivity;
pub use summarization::SummarizationActivity;

use crate::atoms::error::DaemonResult;
use crate::atoms::types::TaskRecord;
use crate::engine::state::DaemonState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Activity: Send + Sync {
    /// The task type this activity serves.
    fn task_type(&self) -> &'static str;

    /// Execute against a claimed task; returns the outcome string stored
    /// on completion.
    async fn execute(&self, state: &Arc<DaemonState>, task: &TaskRecord) -> DaemonResult<String>;
}

/// task_type → activity implementation.
pub struct ActivityRegistry {
    activities: HashMap<&'static str, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        ActivityRegistry {
            activities: HashMap::new(),
        }
    }

    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.activities.insert(activity.task_type(), activity);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(task_type).cloned()
    }

    /// The worker pool's claim capabilities.
    pub fn capabilities(&self) -> Vec<String> {
        self.activities.keys().map(|k| k.to_string()).collect()
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EmbeddingActivity));
        registry.register(Arc::new(SummarizationActivity));
        registry.register(Arc::new(EntityExtractionActivity));
        // Curiosity tasks are deliberately absent: the exploration
        // workflow claims them before it starts, so generic workers
        // must not race for them.
        registry
    }
}
