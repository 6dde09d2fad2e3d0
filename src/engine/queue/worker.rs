// The worker pool. Each worker loops: claim the most urgent ready task
// matching its capabilities, execute the matching activity under the
// start-to-close timeout with a heartbeat ticker, then complete or fail
// it. Workers hold no state that survives restart — crash recovery is
// entirely the stale-task sweep.

use crate::atoms::constants::{
    ACTIVITY_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, STALE_TASK_HOURS, WORKER_IDLE_POLL_MS,
};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{TaskRecord, TaskStatus};
use crate::engine::activities::ActivityRegistry;
use crate::engine::events::EngineEvent;
use crate::engine::state::DaemonState;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Run the startup stale sweep, then spawn the configured number of
    /// workers.
    pub fn spawn(state: Arc<DaemonState>, registry: Arc<ActivityRegistry>) -> WorkerPool {
        match state.store.recover_stale_tasks(STALE_TASK_HOURS) {
            Ok(0) => {}
            Ok(n) => info!("[queue] Stale recovery returned {n} task(s) to ready"),
            Err(e) => error!("[queue] Stale recovery failed: {e}"),
        }

        let count = state.config.worker_count;
        info!("[queue] Starting {count} workers ({:?})", registry.capabilities());
        let handles = (0..count)
            .map(|worker_id| {
                let state = state.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, state, registry).await;
                })
            })
            .collect();
        WorkerPool { handles }
    }

    /// Wait for all workers to observe shutdown and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(worker_id: usize, state: Arc<DaemonState>, registry: Arc<ActivityRegistry>) {
    let capabilities = registry.capabilities();
    loop {
        if state.shutdown.is_cancelled() {
            break;
        }
        let task = match state.store.claim_task(&capabilities) {
            Ok(Some(task)) => task,
            Ok(None) => {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(WORKER_IDLE_POLL_MS)) => continue,
                }
            }
            Err(e) => {
                warn!("[queue] Worker {worker_id} claim failed: {e}");
                tokio::time::sleep(Duration::from_millis(WORKER_IDLE_POLL_MS)).await;
                continue;
            }
        };
        run_claimed_task(&state, &registry, &task).await;
    }
    info!("[queue] Worker {worker_id} stopped");
}

/// Execute one claimed task to a terminal or retried state.
pub async fn run_claimed_task(
    state: &Arc<DaemonState>,
    registry: &ActivityRegistry,
    task: &TaskRecord,
) {
    let activity = match registry.get(&task.task_type) {
        Some(a) => a,
        None => {
            // Unknown task types fail cleanly, never crash the worker.
            let msg = format!("no activity registered for task type '{}'", task.task_type);
            error!("[queue] {msg}");
            if let Err(e) = state.store.fail_task(task.id, &msg, false) {
                error!("[queue] Failed to fail task {}: {e}", task.id);
            }
            return;
        }
    };

    // Heartbeat ticker: keeps `updated_at` fresh so the stale sweep knows
    // this claim is live.
    let ticker_state = state.clone();
    let task_id = task.id;
    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)).await;
            if ticker_state.store.touch_task(task_id).is_err() {
                break;
            }
        }
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(ACTIVITY_TIMEOUT_SECS),
        activity.execute(state, task),
    )
    .await
    .unwrap_or_else(|_| {
        Err(DaemonError::Timeout(format!(
            "activity '{}' exceeded start-to-close timeout",
            task.task_type
        )))
    });
    ticker.abort();

    settle_task(state, task, outcome);
}

fn settle_task(state: &Arc<DaemonState>, task: &TaskRecord, outcome: DaemonResult<String>) {
    match outcome {
        Ok(result) => {
            if let Err(e) = state.store.complete_task(task.id, &result) {
                error!("[queue] Failed to complete task {}: {e}", task.id);
                return;
            }
            info!("[queue] Task {} ({}) completed", task.id, task.task_type);
            state.events.emit(EngineEvent::TaskCompleted {
                task_id: task.id,
                task_type: task.task_type.clone(),
            });
        }
        Err(err) => {
            let retry = err.retryable();
            match state.store.fail_task(task.id, &err.to_string(), retry) {
                Ok(TaskStatus::Ready) => {
                    warn!(
                        "[queue] Task {} ({}) failed, will retry: {err}",
                        task.id, task.task_type
                    );
                }
                Ok(_) => {
                    warn!(
                        "[queue] Task {} ({}) failed terminally: {err}",
                        task.id, task.task_type
                    );
                    state.events.emit(EngineEvent::TaskFailed {
                        task_id: task.id,
                        task_type: task.task_type.clone(),
                        error: err.to_string(),
                    });
                }
                Err(e) => error!("[queue] Failed to record failure for task {}: {e}", task.id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::constants::{MAX_TASK_ATTEMPTS, PRIORITY_HIGH};
    use crate::engine::activities::Activity;
    use crate::engine::queue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test double that succeeds or fails on command and counts runs.
    struct ScriptedActivity {
        runs: Arc<AtomicUsize>,
        fail_retryable: bool,
        fail_fatal: bool,
    }

    #[async_trait]
    impl Activity for ScriptedActivity {
        fn task_type(&self) -> &'static str {
            "scripted"
        }

        async fn execute(
            &self,
            _state: &Arc<DaemonState>,
            _task: &TaskRecord,
        ) -> DaemonResult<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_fatal {
                Err(DaemonError::Validation("bad input".into()))
            } else if self.fail_retryable {
                Err(DaemonError::Timeout("flaky upstream".into()))
            } else {
                Ok("ok".into())
            }
        }
    }

    fn scripted_registry(runs: Arc<AtomicUsize>, retryable: bool, fatal: bool) -> ActivityRegistry {
        let mut registry = ActivityRegistry::new();
        registry.register(Arc::new(ScriptedActivity {
            runs,
            fail_retryable: retryable,
            fail_fatal: fatal,
        }));
        registry
    }

    #[tokio::test]
    async fn successful_task_completes_with_single_attempt() {
        let state = Arc::new(DaemonState::for_testing());
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = scripted_registry(runs.clone(), false, false);

        let id = queue::enqueue(
            &state,
            "scripted",
            None,
            "do the thing",
            serde_json::json!({}),
            PRIORITY_HIGH,
            None,
        )
        .unwrap();

        let task = state.store.claim_task(&registry.capabilities()).unwrap().unwrap();
        run_claimed_task(&state, &registry, &task).await;

        let done = state.store.get_task(id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt_count, 1);
        assert_eq!(done.outcome.as_deref(), Some("ok"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failure_returns_task_to_ready() {
        let state = Arc::new(DaemonState::for_testing());
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = scripted_registry(runs.clone(), true, false);

        let id = queue::enqueue(
            &state,
            "scripted",
            None,
            "flaky",
            serde_json::json!({}),
            PRIORITY_HIGH,
            None,
        )
        .unwrap();

        let task = state.store.claim_task(&registry.capabilities()).unwrap().unwrap();
        run_claimed_task(&state, &registry, &task).await;

        let after = state.store.get_task(id).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Ready);
        assert_eq!(after.attempt_count, 1);
        assert!(after.run_after.is_some());
    }

    #[tokio::test]
    async fn fatal_failure_is_terminal_immediately() {
        let state = Arc::new(DaemonState::for_testing());
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = scripted_registry(runs.clone(), false, true);

        let id = queue::enqueue(
            &state,
            "scripted",
            None,
            "bad",
            serde_json::json!({}),
            PRIORITY_HIGH,
            None,
        )
        .unwrap();

        let task = state.store.claim_task(&registry.capabilities()).unwrap().unwrap();
        run_claimed_task(&state, &registry, &task).await;

        let after = state.store.get_task(id).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.attempt_count, 1, "fatal failures do not retry");
    }

    #[tokio::test]
    async fn unknown_task_type_fails_cleanly() {
        let state = Arc::new(DaemonState::for_testing());
        let registry = ActivityRegistry::new();

        let id = queue::enqueue(
            &state,
            "mystery",
            None,
            "???",
            serde_json::json!({}),
            PRIORITY_HIGH,
            None,
        )
        .unwrap();
        // Claim through a capability list that includes the unknown type,
        // as a stale registry might.
        let task = state
            .store
            .claim_task(&["mystery".to_string()])
            .unwrap()
            .unwrap();
        run_claimed_task(&state, &registry, &task).await;

        let after = state.store.get_task(id).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert!(after.last_error.unwrap().contains("no activity registered"));
    }

    #[tokio::test]
    async fn pool_drains_queue_end_to_end() {
        let state = Arc::new(DaemonState::for_testing());
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(scripted_registry(runs.clone(), false, false));

        for i in 0..5 {
            queue::enqueue(
                &state,
                "scripted",
                None,
                &format!("task {i}"),
                serde_json::json!({}),
                PRIORITY_HIGH,
                None,
            )
            .unwrap();
        }

        let pool = WorkerPool::spawn(state.clone(), registry);
        // Workers claim within well under a second on an idle queue.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        state.shutdown.cancel();
        pool.join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        let counts = state.store.task_counts().unwrap();
        let completed = counts
            .iter()
            .find(|(s, _)| s == "completed")
            .map(|(_, n)| *n)
            .unwrap_or(0);
        assert_eq!(completed, 5);
    }

    #[tokio::test]
    async fn repeated_retries_exhaust_attempt_budget() {
        let state = Arc::new(DaemonState::for_testing());
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = scripted_registry(runs.clone(), true, false);

        let id = queue::enqueue(
            &state,
            "scripted",
            None,
            "always fails",
            serde_json::json!({}),
            PRIORITY_HIGH,
            None,
        )
        .unwrap();

        for _ in 0..MAX_TASK_ATTEMPTS {
            // Clear the backoff so each claim is immediate in test time.
            {
                let conn = state.store.conn.lock();
                conn.execute(
                    "UPDATE project_tasks SET run_after = NULL WHERE id = ?1",
                    rusqlite::params![id],
                )
                .unwrap();
            }
            let task = state.store.claim_task(&registry.capabilities()).unwrap().unwrap();
            run_claimed_task(&state, &registry, &task).await;
        }

        let after = state.store.get_task(id).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.attempt_count, MAX_TASK_ATTEMPTS);
        assert_eq!(runs.load(Ordering::SeqCst), MAX_TASK_ATTEMPTS as usize);
    }
}
