// ── dere engine: Request Surface ───────────────────────────────────────────
// Two transports, one handler set: a Unix-domain line-delimited JSON-RPC
// channel for hooks, and an HTTP+JSON endpoint on localhost for the UI,
// the CLI, and cross-language hooks. Both funnel into `dispatch`.
//
// Idempotency: a request carrying a client-supplied `request_id` replays
// the recorded response within the replay window instead of re-executing.

pub mod handlers;
pub mod http;
pub mod uds;

use crate::atoms::constants::{REPLAY_WINDOW_SECS, RPC_TIMEOUT_SECS};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::engine::state::DaemonState;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Taxonomy tag used in error envelopes.
fn error_code(err: &DaemonError) -> &'static str {
    match err {
        DaemonError::Validation(_) | DaemonError::Serialization(_) => "validation",
        DaemonError::Permission(_) => "permission",
        DaemonError::Resource(_) => "resource",
        DaemonError::Terminal(_) => "terminal",
        DaemonError::Cancelled(_) => "cancelled",
        _ if err.retryable() => "transient",
        _ => "internal",
    }
}

/// The wire error envelope shared by both transports.
pub fn error_envelope(err: &DaemonError) -> Value {
    json!({
        "error": {
            "code": error_code(err),
            "message": err.to_string(),
            "retryable": err.retryable(),
        }
    })
}

/// Execute one request with the per-RPC timeout, the in-flight counter
/// for shutdown draining, and request-id replay.
pub async fn dispatch(state: &Arc<DaemonState>, method: &str, params: Value) -> DaemonResult<Value> {
    let request_id = params["request_id"].as_str().map(str::to_string);

    if let Some(ref rid) = request_id {
        let now = chrono::Utc::now().timestamp();
        let mut replay = state.replay.lock();
        replay.retain(|_, (ts, _)| now - *ts < REPLAY_WINDOW_SECS);
        if let Some((_, response)) = replay.get(rid) {
            return Ok(response.clone());
        }
    }

    state.inflight_handlers.fetch_add(1, Ordering::SeqCst);
    let result = tokio::time::timeout(
        Duration::from_secs(RPC_TIMEOUT_SECS),
        handlers::handle(state, method, &params),
    )
    .await
    .unwrap_or_else(|_| {
        Err(DaemonError::Timeout(format!(
            "handler '{method}' exceeded the RPC timeout"
        )))
    });
    state.inflight_handlers.fetch_sub(1, Ordering::SeqCst);

    if let (Some(rid), Ok(ref response)) = (request_id, &result) {
        state
            .replay
            .lock()
            .insert(rid, (chrono::Utc::now().timestamp(), response.clone()));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_method_is_validation_error() {
        let state = Arc::new(DaemonState::for_testing());
        let err = dispatch(&state, "no_such_method", json!({})).await.unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
        let envelope = error_envelope(&err);
        assert_eq!(envelope["error"]["code"], "validation");
        assert_eq!(envelope["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn request_id_replays_response() {
        let state = Arc::new(DaemonState::for_testing());
        let params = json!({
            "request_id": "hook-retry-1",
            "task_type": "embedding",
            "content": "embed me",
            "priority": "high",
        });
        let first = dispatch(&state, "enqueue_task", params.clone()).await.unwrap();
        let second = dispatch(&state, "enqueue_task", params).await.unwrap();
        assert_eq!(first["task_id"], second["task_id"]);

        // Only one task actually exists.
        let counts = state.store.task_counts().unwrap();
        let ready: i64 = counts
            .iter()
            .find(|(s, _)| s == "ready")
            .map(|(_, n)| *n)
            .unwrap_or(0);
        assert_eq!(ready, 1);
    }
}
