// Durable workflow runs. A workflow's position — which step is next and
// what results it already has — lives here so a restart resumes instead
// of re-doing completed steps.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::WorkflowRun;
use rusqlite::params;

impl WorkflowRun {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let input: String = row.get(2)?;
        let steps: String = row.get(3)?;
        Ok(WorkflowRun {
            id: row.get(0)?,
            kind: row.get(1)?,
            input: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
            step_results: serde_json::from_str(&steps).unwrap_or_default(),
            current_step: row.get(4)?,
            status: row.get(5)?,
            heartbeat_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

const RUN_COLS: &str =
    "id, kind, input, step_results, current_step, status, heartbeat_at, created_at, updated_at";

impl Store {
    pub fn create_workflow_run(
        &self,
        id: &str,
        kind: &str,
        input: &serde_json::Value,
    ) -> DaemonResult<()> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO workflow_runs (id, kind, input, heartbeat_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
            params![id, kind, serde_json::to_string(input)?, now],
        )?;
        Ok(())
    }

    pub fn get_workflow_run(&self, id: &str) -> DaemonResult<Option<WorkflowRun>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {RUN_COLS} FROM workflow_runs WHERE id = ?1"))?;
        let result = stmt
            .query_map(params![id], WorkflowRun::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    /// Record a completed step's result; re-execution with the same step
    /// name is a no-op for the data store.
    pub fn record_workflow_step(
        &self,
        id: &str,
        step: &str,
        result: &serde_json::Value,
    ) -> DaemonResult<()> {
        let mut run = match self.get_workflow_run(id)? {
            Some(r) => r,
            None => return Ok(()),
        };
        if run.step_results.contains_key(step) {
            return Ok(());
        }
        run.step_results.insert(step.to_string(), result.clone());
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE workflow_runs
             SET step_results = ?2, current_step = ?3, updated_at = ?4, heartbeat_at = ?4
             WHERE id = ?1",
            params![
                id,
                serde_json::to_string(&run.step_results)?,
                step,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn heartbeat_workflow(&self, id: &str) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE workflow_runs SET heartbeat_at = ?2 WHERE id = ?1 AND status = 'running'",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn finish_workflow_run(&self, id: &str, status: &str) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE workflow_runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Runs still marked running — candidates for resume at startup, or
    /// for heartbeat-timeout retry when `heartbeat_at` is stale.
    pub fn running_workflow_runs(&self) -> DaemonResult<Vec<WorkflowRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLS} FROM workflow_runs WHERE status = 'running' ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([], WorkflowRun::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}
