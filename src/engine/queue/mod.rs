// ── dere engine: Task Queue & Worker Pool ──────────────────────────────────
// The queue itself is the `project_tasks` table (see store::tasks); this
// module runs the workers that drain it. Enqueue helpers live here so
// hooks and internal callers share one path.

pub mod worker;

pub use worker::WorkerPool;

use crate::atoms::constants::{PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::engine::state::DaemonState;
use crate::engine::store::NewTask;

/// Map the wire priority ("high" | "normal" | "low" | integer) to the
/// internal scale where smaller is more urgent.
pub fn parse_priority(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::String(s) => match s.as_str() {
            "high" => PRIORITY_HIGH,
            "low" => PRIORITY_LOW,
            _ => PRIORITY_NORMAL,
        },
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|p| p.clamp(PRIORITY_HIGH, PRIORITY_LOW))
            .unwrap_or(PRIORITY_NORMAL),
        _ => PRIORITY_NORMAL,
    }
}

/// Durably enqueue background work; returns the task id.
pub fn enqueue(
    state: &DaemonState,
    task_type: &str,
    model: Option<&str>,
    content: &str,
    metadata: serde_json::Value,
    priority: i64,
    session_id: Option<i64>,
) -> DaemonResult<i64> {
    if task_type.is_empty() {
        return Err(DaemonError::Validation("task_type is required".into()));
    }
    let title = match content.char_indices().nth(60) {
        Some((idx, _)) => format!("{}…", &content[..idx]),
        None => content.to_string(),
    };
    state.store.enqueue_task(&NewTask {
        title,
        description: content.to_string(),
        task_type: task_type.to_string(),
        priority,
        extra: metadata,
        session_id,
        model: model.map(str::to_string),
        ..Default::default()
    })
}
