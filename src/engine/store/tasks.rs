// The durable task queue (`project_tasks`). The claim is the only path
// from `ready` to `in_progress` and is a single atomic UPDATE, so two
// workers can never hold the same task. Effective priority ages toward 1
// (one step per hour) to prevent starvation.

use super::{now_rfc3339, parse_rfc3339, Store};
use crate::atoms::constants::{MAX_TASK_ATTEMPTS, TASK_BACKOFF_BASE_SECS};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{TaskRecord, TaskStatus};
use rusqlite::params;
use std::str::FromStr;

const TASK_COLS: &str = "id, title, description, task_type, status, priority, attempt_count, \
                         created_at, updated_at, started_at, completed_at, run_after, extra, \
                         outcome, last_error, blocked_by, discovered_from_task_id, session_id, model";

impl TaskRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(4)?;
        let extra: String = row.get(12)?;
        let blocked_by: String = row.get(15)?;
        Ok(TaskRecord {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            task_type: row.get(3)?,
            status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Failed),
            priority: row.get(5)?,
            attempt_count: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            run_after: row.get(11)?,
            extra: serde_json::from_str(&extra).unwrap_or(serde_json::Value::Null),
            outcome: row.get(13)?,
            last_error: row.get(14)?,
            blocked_by: serde_json::from_str(&blocked_by).unwrap_or_default(),
            discovered_from_task_id: row.get(16)?,
            session_id: row.get(17)?,
            model: row.get(18)?,
        })
    }
}

/// Parameters for enqueueing a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub extra: serde_json::Value,
    pub blocked_by: Vec<i64>,
    pub discovered_from_task_id: Option<i64>,
    pub session_id: Option<i64>,
    pub model: Option<String>,
}

impl Store {
    // ── Enqueue / claim / complete / fail ──────────────────────────────

    /// Durably enqueue a task; returns its id. Tasks with unmet
    /// `blocked_by` start as `blocked`.
    pub fn enqueue_task(&self, new: &NewTask) -> DaemonResult<i64> {
        if new.task_type.is_empty() {
            return Err(DaemonError::Validation("task_type must not be empty".into()));
        }
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let status = if new.blocked_by.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Blocked
        };
        conn.execute(
            "INSERT INTO project_tasks
                 (title, description, task_type, status, priority, created_at, updated_at,
                  extra, blocked_by, discovered_from_task_id, session_id, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                new.title,
                new.description,
                new.task_type,
                status.as_str(),
                new.priority,
                now,
                serde_json::to_string(&new.extra)?,
                serde_json::to_string(&new.blocked_by)?,
                new.discovered_from_task_id,
                new.session_id,
                new.model,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim the most urgent ready task whose type is in
    /// `capabilities`. Bumps `attempt_count`, sets `started_at`.
    /// Ordering is effective priority (aged by +1 step per hour, clamped
    /// to 1) ascending, then FIFO.
    pub fn claim_task(&self, capabilities: &[String]) -> DaemonResult<Option<TaskRecord>> {
        if capabilities.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let placeholders = capabilities
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE project_tasks
             SET status = 'in_progress', started_at = ?1, updated_at = ?1,
                 attempt_count = attempt_count + 1, run_after = NULL
             WHERE id = (
                 SELECT id FROM project_tasks
                 WHERE status = 'ready'
                   AND (run_after IS NULL OR run_after <= ?1)
                   AND task_type IN ({placeholders})
                 ORDER BY MAX(1, priority - CAST((julianday(?1) - julianday(created_at)) * 24.0 AS INTEGER)) ASC,
                          created_at ASC
                 LIMIT 1
             )
             RETURNING {TASK_COLS}"
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now)];
        for cap in capabilities {
            values.push(Box::new(cap.clone()));
        }
        let mut stmt = conn.prepare(&sql)?;
        let task = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), TaskRecord::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(task)
    }

    /// Mark an in-progress task completed with its outcome, then unblock
    /// any tasks that were waiting on it.
    pub fn complete_task(&self, id: i64, outcome: &str) -> DaemonResult<()> {
        {
            let conn = self.conn.lock();
            let now = now_rfc3339();
            let updated = conn.execute(
                "UPDATE project_tasks
                 SET status = 'completed', outcome = ?2, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'in_progress'",
                params![id, outcome, now],
            )?;
            if updated == 0 {
                return Err(DaemonError::Validation(format!(
                    "task {id} is not in_progress"
                )));
            }
        }
        self.unblock_dependents(id)?;
        Ok(())
    }

    /// Leave `in_progress` on failure. When `retry` and the attempt budget
    /// remains, the task reverts to `ready` with exponential backoff
    /// (1s, 2s, 4s); otherwise it is terminally failed.
    pub fn fail_task(&self, id: i64, error: &str, retry: bool) -> DaemonResult<TaskStatus> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let attempts: i64 = conn
            .query_row(
                "SELECT attempt_count FROM project_tasks WHERE id = ?1 AND status = 'in_progress'",
                params![id],
                |r| r.get(0),
            )
            .map_err(|_| DaemonError::Validation(format!("task {id} is not in_progress")))?;

        if retry && attempts < MAX_TASK_ATTEMPTS {
            let delay = TASK_BACKOFF_BASE_SECS << (attempts - 1).max(0);
            let run_after = (chrono::Utc::now() + chrono::Duration::seconds(delay)).to_rfc3339();
            conn.execute(
                "UPDATE project_tasks
                 SET status = 'ready', started_at = NULL, last_error = ?2,
                     run_after = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, error, run_after, now],
            )?;
            Ok(TaskStatus::Ready)
        } else {
            conn.execute(
                "UPDATE project_tasks
                 SET status = 'failed', last_error = ?2, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1",
                params![id, error, now],
            )?;
            Ok(TaskStatus::Failed)
        }
    }

    /// Release a claimed task back to `ready` without consuming the
    /// failure path — used by workflows that claimed tasks before
    /// starting and must return them on workflow failure.
    pub fn release_task(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE project_tasks
             SET status = 'ready', started_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Flip `blocked` tasks to `ready` once every blocker is terminal.
    fn unblock_dependents(&self, completed_id: i64) -> DaemonResult<()> {
        let blocked = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLS} FROM project_tasks WHERE status = 'blocked'"
            ))?;
            let rows = stmt
                .query_map([], TaskRecord::from_row)?
                .filter_map(|r| r.ok())
                .filter(|t| t.blocked_by.contains(&completed_id))
                .collect::<Vec<_>>();
            rows
        };
        for task in blocked {
            let all_done = task.blocked_by.iter().all(|dep| {
                self.get_task(*dep)
                    .ok()
                    .flatten()
                    .map(|d| d.status.is_terminal())
                    .unwrap_or(true)
            });
            if all_done {
                let conn = self.conn.lock();
                conn.execute(
                    "UPDATE project_tasks SET status = 'ready', updated_at = ?2
                     WHERE id = ?1 AND status = 'blocked'",
                    params![task.id, now_rfc3339()],
                )?;
            }
        }
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn get_task(&self, id: i64) -> DaemonResult<Option<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM project_tasks WHERE id = ?1"
        ))?;
        let result = stmt
            .query_map(params![id], TaskRecord::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    /// Ready tasks of a type, most urgent first. Does not claim.
    pub fn ready_tasks_of_type(&self, task_type: &str, limit: usize) -> DaemonResult<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM project_tasks
             WHERE status = 'ready' AND task_type = ?1
             ORDER BY priority ASC, created_at ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![task_type, limit as i64], TaskRecord::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Whether any high-priority ready task exists (escalation trigger).
    pub fn has_critical_ready_task(&self) -> DaemonResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM project_tasks WHERE status = 'ready' AND priority = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Queue depth per status, for the dashboard.
    pub fn task_counts(&self) -> DaemonResult<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM project_tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Delete a task outright (backlog garbage collection).
    pub fn delete_task(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM project_tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Update a task's priority (backlog recompute).
    pub fn set_task_priority(&self, id: i64, priority: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE project_tasks SET priority = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, priority, now_rfc3339()],
        )?;
        Ok(())
    }

    // ── Stale recovery ─────────────────────────────────────────────────

    /// Revert `in_progress` tasks untouched for longer than
    /// `threshold_hours` back to `ready` with `started_at` cleared. The
    /// sole crash-recovery mechanism for workers.
    pub fn recover_stale_tasks(&self, threshold_hours: i64) -> DaemonResult<usize> {
        let conn = self.conn.lock();
        let cutoff =
            (chrono::Utc::now() - chrono::Duration::hours(threshold_hours)).to_rfc3339();
        let count = conn.execute(
            "UPDATE project_tasks
             SET status = 'ready', started_at = NULL, updated_at = ?1
             WHERE status = 'in_progress' AND updated_at < ?2",
            params![now_rfc3339(), cutoff],
        )?;
        Ok(count)
    }

    /// Touch an in-progress task so the stale sweep knows its worker is
    /// alive (called from activity heartbeats).
    pub fn touch_task(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE project_tasks SET updated_at = ?2 WHERE id = ?1 AND status = 'in_progress'",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Age of the oldest ready task, in hours (diagnostics / tests).
    pub fn oldest_ready_age_hours(&self) -> DaemonResult<Option<f64>> {
        let conn = self.conn.lock();
        let created: Option<String> = conn.query_row(
            "SELECT MIN(created_at) FROM project_tasks WHERE status = 'ready'",
            [],
            |r| r.get(0),
        )?;
        Ok(created.map(|c| {
            (chrono::Utc::now() - parse_rfc3339(&c)).num_seconds() as f64 / 3600.0
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::constants::{PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};

    fn new_task(task_type: &str, priority: i64) -> NewTask {
        NewTask {
            title: format!("{task_type} task"),
            description: "payload".into(),
            task_type: task_type.into(),
            priority,
            extra: serde_json::json!({}),
            ..Default::default()
        }
    }

    fn caps(types: &[&str]) -> Vec<String> {
        types.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn claim_moves_to_in_progress_and_bumps_attempts() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue_task(&new_task("embedding", PRIORITY_HIGH)).unwrap();
        let claimed = store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.started_at.is_some());
        // Second claim gets nothing
        assert!(store.claim_task(&caps(&["embedding"])).unwrap().is_none());
    }

    #[test]
    fn claim_respects_capabilities() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_task(&new_task("summarization", PRIORITY_NORMAL)).unwrap();
        assert!(store.claim_task(&caps(&["embedding"])).unwrap().is_none());
        assert!(store.claim_task(&caps(&["embedding", "summarization"])).unwrap().is_some());
    }

    #[test]
    fn priority_orders_claims() {
        let store = Store::open_in_memory().unwrap();
        let low = store.enqueue_task(&new_task("embedding", PRIORITY_LOW)).unwrap();
        let high = store.enqueue_task(&new_task("embedding", PRIORITY_HIGH)).unwrap();
        let first = store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
        assert_eq!(first.id, high);
        let second = store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
        assert_eq!(second.id, low);
    }

    #[test]
    fn priority_boost_ages_old_tasks() {
        let store = Store::open_in_memory().unwrap();
        let old = store.enqueue_task(&new_task("embedding", PRIORITY_LOW)).unwrap();
        // Backdate the low-priority task far enough for the boost to clamp to 1
        {
            let conn = store.conn.lock();
            let past = (chrono::Utc::now() - chrono::Duration::hours(10)).to_rfc3339();
            conn.execute(
                "UPDATE project_tasks SET created_at = ?2 WHERE id = ?1",
                params![old, past],
            )
            .unwrap();
        }
        store.enqueue_task(&new_task("embedding", PRIORITY_NORMAL)).unwrap();
        let first = store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
        assert_eq!(first.id, old, "aged low-priority task should win");
    }

    #[test]
    fn fail_with_retry_reverts_to_ready_with_backoff() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue_task(&new_task("embedding", PRIORITY_HIGH)).unwrap();
        store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
        let status = store.fail_task(id, "connection refused", true).unwrap();
        assert_eq!(status, TaskStatus::Ready);
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.started_at.is_none());
        assert!(task.run_after.is_some());
        assert_eq!(task.last_error.as_deref(), Some("connection refused"));
        // run_after is in the future, so an immediate claim skips it
        assert!(store.claim_task(&caps(&["embedding"])).unwrap().is_none());
    }

    #[test]
    fn fail_past_budget_is_terminal() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue_task(&new_task("embedding", PRIORITY_HIGH)).unwrap();
        for _ in 0..MAX_TASK_ATTEMPTS {
            // Clear backoff so the claim succeeds immediately
            {
                let conn = store.conn.lock();
                conn.execute(
                    "UPDATE project_tasks SET run_after = NULL WHERE id = ?1",
                    params![id],
                )
                .unwrap();
            }
            store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
            store.fail_task(id, "boom", true).unwrap();
        }
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, MAX_TASK_ATTEMPTS);
    }

    #[test]
    fn stale_recovery_requeues_orphans() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue_task(&new_task("summarization", PRIORITY_NORMAL)).unwrap();
        store.claim_task(&caps(&["summarization"])).unwrap().unwrap();
        // Simulate a crashed worker: backdate updated_at past the threshold
        {
            let conn = store.conn.lock();
            let past = (chrono::Utc::now() - chrono::Duration::hours(7)).to_rfc3339();
            conn.execute(
                "UPDATE project_tasks SET updated_at = ?2 WHERE id = ?1",
                params![id, past],
            )
            .unwrap();
        }
        let recovered = store.recover_stale_tasks(6).unwrap();
        assert_eq!(recovered, 1);
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.started_at.is_none());
        // Re-claim bumps attempts to 2
        let reclaimed = store.claim_task(&caps(&["summarization"])).unwrap().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[test]
    fn blocked_tasks_unblock_when_dependencies_complete() {
        let store = Store::open_in_memory().unwrap();
        let dep = store.enqueue_task(&new_task("embedding", PRIORITY_HIGH)).unwrap();
        let blocked = store
            .enqueue_task(&NewTask {
                blocked_by: vec![dep],
                ..new_task("summarization", PRIORITY_NORMAL)
            })
            .unwrap();
        assert!(store.claim_task(&caps(&["summarization"])).unwrap().is_none());

        store.claim_task(&caps(&["embedding"])).unwrap().unwrap();
        store.complete_task(dep, "done").unwrap();

        let task = store.get_task(blocked).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[test]
    fn complete_requires_in_progress() {
        let store = Store::open_in_memory().unwrap();
        let id = store.enqueue_task(&new_task("embedding", PRIORITY_HIGH)).unwrap();
        assert!(store.complete_task(id, "nope").is_err());
    }
}
