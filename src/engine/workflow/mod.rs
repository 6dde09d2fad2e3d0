// ── dere engine: Workflow Engine ───────────────────────────────────────────
// Durable multi-step orchestration on top of the raw task queue. A
// workflow's position lives in `workflow_runs`: each completed step's
// result is memoized by name, so re-executing the workflow after a crash
// replays completed steps from the store and only runs what's left.
//
// Step execution heartbeats every 10s; the monitor loop treats a running
// workflow with no heartbeat for 60s as lost and re-runs it from its
// persisted position on a fresh task. Cancellation is cooperative via the
// run's CancelToken.

pub mod exploration;

use crate::atoms::constants::{ACTIVITY_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::WorkflowRun;
use crate::engine::cancel::CancelToken;
use crate::engine::state::DaemonState;
use crate::engine::store::parse_rfc3339;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Create a durable run and register its cancellation token. Returns the
/// run id.
pub fn start_run(
    state: &Arc<DaemonState>,
    kind: &str,
    input: &serde_json::Value,
) -> DaemonResult<String> {
    let run_id = uuid::Uuid::new_v4().to_string();
    state.store.create_workflow_run(&run_id, kind, input)?;
    state
        .workflow_cancels
        .lock()
        .insert(run_id.clone(), CancelToken::new());
    Ok(run_id)
}

/// The cancel token for a live run (a fresh one if the run was resumed
/// after restart and has no registered token yet).
pub fn cancel_token(state: &Arc<DaemonState>, run_id: &str) -> CancelToken {
    state
        .workflow_cancels
        .lock()
        .entry(run_id.to_string())
        .or_default()
        .clone()
}

/// Ask a workflow to cancel. The signal is observable from inside
/// activities; subsequent steps are treated as skipped by the workflow.
pub fn request_cancel(state: &Arc<DaemonState>, run_id: &str) -> bool {
    match state.workflow_cancels.lock().get(run_id) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    }
}

/// Mark a run finished and drop its token.
pub fn finish_run(state: &Arc<DaemonState>, run_id: &str, status: &str) {
    if let Err(e) = state.store.finish_workflow_run(run_id, status) {
        warn!("[workflow] Failed to finish run {run_id}: {e}");
    }
    state.workflow_cancels.lock().remove(run_id);
}

/// Execute one idempotent step. If the run already has a result for
/// `name`, that result is returned without executing; otherwise the
/// future runs under the start-to-close timeout with heartbeating, and
/// its result is persisted before being returned.
pub async fn run_step<T, F>(
    state: &Arc<DaemonState>,
    run_id: &str,
    name: &str,
    fut: F,
) -> DaemonResult<T>
where
    T: Serialize + DeserializeOwned,
    F: Future<Output = DaemonResult<T>>,
{
    if let Some(run) = state.store.get_workflow_run(run_id)? {
        if let Some(cached) = run.step_results.get(name) {
            info!("[workflow] Run {run_id}: step '{name}' already complete, replaying result");
            return Ok(serde_json::from_value(cached.clone())?);
        }
    }

    let cancel = cancel_token(state, run_id);
    if cancel.is_cancelled() {
        return Err(DaemonError::Cancelled(format!("run {run_id} cancelled before '{name}'")));
    }

    // Liveness ping every 10s while the step runs.
    let hb_state = state.clone();
    let hb_run = run_id.to_string();
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)).await;
            if hb_state.store.heartbeat_workflow(&hb_run).is_err() {
                break;
            }
        }
    });

    let result = tokio::select! {
        out = tokio::time::timeout(Duration::from_secs(ACTIVITY_TIMEOUT_SECS), fut) => {
            out.unwrap_or_else(|_| Err(DaemonError::Timeout(format!(
                "step '{name}' exceeded start-to-close timeout"
            ))))
        }
        _ = cancel.cancelled() => {
            Err(DaemonError::Cancelled(format!("run {run_id} cancelled during '{name}'")))
        }
    };
    heartbeat.abort();

    let value = result?;
    state
        .store
        .record_workflow_step(run_id, name, &serde_json::to_value(&value)?)?;
    Ok(value)
}

/// Resume every non-terminal run left over from a previous process, and
/// fail orphaned swarm runs (the swarm coordinator has its own startup
/// cleanup and will mark those).
pub fn resume_unfinished_runs(state: &Arc<DaemonState>) {
    let runs = match state.store.running_workflow_runs() {
        Ok(runs) => runs,
        Err(e) => {
            warn!("[workflow] Could not list unfinished runs: {e}");
            return;
        }
    };
    for run in runs {
        info!("[workflow] Resuming {} run {} from step {:?}", run.kind, run.id, run.current_step);
        respawn(state, run);
    }
}

fn respawn(state: &Arc<DaemonState>, run: WorkflowRun) {
    let state = state.clone();
    tokio::spawn(async move {
        match run.kind.as_str() {
            "exploration" => {
                let task_id = run.input["task_id"].as_i64().unwrap_or(0);
                if task_id > 0 {
                    let _ = exploration::resume(&state, &run.id, task_id).await;
                }
            }
            "batch_exploration" => {
                let ids: Vec<i64> = serde_json::from_value(run.input["task_ids"].clone())
                    .unwrap_or_default();
                let _ = exploration::resume_batch(&state, &run.id, ids).await;
            }
            "swarm" => {
                // Swarm runs do not survive their coordinator; startup
                // cleanup marks the swarm orphaned, so close the run.
                finish_run(&state, &run.id, "failed");
            }
            other => {
                warn!("[workflow] Unknown workflow kind '{other}', failing run {}", run.id);
                finish_run(&state, &run.id, "failed");
            }
        }
    });
}

/// Periodic monitor: a running workflow whose heartbeat is older than the
/// timeout lost its executor (crash or hang). Cancel whatever may still
/// hold it and re-run from the persisted position.
pub async fn monitor_loop(state: Arc<DaemonState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)) => {}
        }
        let runs = match state.store.running_workflow_runs() {
            Ok(runs) => runs,
            Err(e) => {
                warn!("[workflow] Monitor query failed: {e}");
                continue;
            }
        };
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(HEARTBEAT_TIMEOUT_SECS);
        for run in runs {
            if parse_rfc3339(&run.heartbeat_at) < cutoff {
                warn!(
                    "[workflow] Run {} ({}) lost its heartbeat — retrying from step {:?}",
                    run.id, run.kind, run.current_step
                );
                if let Some(token) = state.workflow_cancels.lock().get(&run.id) {
                    token.cancel();
                }
                state.workflow_cancels.lock().remove(&run.id);
                // Refresh the heartbeat before respawning so the monitor
                // doesn't double-fire while the retry warms up.
                let _ = state.store.heartbeat_workflow(&run.id);
                respawn(&state, run);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_steps_replay_without_reexecution() {
        let state = Arc::new(DaemonState::for_testing());
        let run_id = start_run(&state, "exploration", &serde_json::json!({"task_id": 1})).unwrap();

        let first: i32 = run_step(&state, &run_id, "compute", async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(first, 42);

        // Re-execution with a different body must return the memoized
        // result — the same effect on the store as a single execution.
        let replayed: i32 = run_step(&state, &run_id, "compute", async {
            panic!("step body must not run again")
        })
        .await
        .unwrap();
        assert_eq!(replayed, 42);
    }

    #[tokio::test]
    async fn cancelled_run_rejects_new_steps() {
        let state = Arc::new(DaemonState::for_testing());
        let run_id = start_run(&state, "exploration", &serde_json::json!({})).unwrap();
        assert!(request_cancel(&state, &run_id));

        let result: DaemonResult<i32> = run_step(&state, &run_id, "late", async { Ok(1) }).await;
        assert!(matches!(result, Err(DaemonError::Cancelled(_))));
    }

    #[tokio::test]
    async fn step_failure_propagates_and_is_not_memoized() {
        let state = Arc::new(DaemonState::for_testing());
        let run_id = start_run(&state, "exploration", &serde_json::json!({})).unwrap();

        let failed: DaemonResult<i32> = run_step(&state, &run_id, "flaky", async {
            Err(DaemonError::Timeout("upstream".into()))
        })
        .await;
        assert!(failed.is_err());

        // A retry actually executes and can succeed.
        let retried: i32 = run_step(&state, &run_id, "flaky", async { Ok(7) }).await.unwrap();
        assert_eq!(retried, 7);
    }

    #[tokio::test]
    async fn finish_drops_cancel_token() {
        let state = Arc::new(DaemonState::for_testing());
        let run_id = start_run(&state, "exploration", &serde_json::json!({})).unwrap();
        assert!(state.workflow_cancels.lock().contains_key(&run_id));
        finish_run(&state, &run_id, "completed");
        assert!(!state.workflow_cancels.lock().contains_key(&run_id));
        let run = state.store.get_workflow_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, "completed");
    }
}
