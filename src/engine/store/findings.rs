// Exploration findings and the surfaced-findings ledger. A finding that
// was injected into a session's context within the suppression window
// must not be injected there again.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::ExplorationFinding;
use rusqlite::params;

impl ExplorationFinding {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(ExplorationFinding {
            id: row.get(0)?,
            task_id: row.get(1)?,
            finding: row.get(2)?,
            confidence: row.get(3)?,
            promoted: row.get::<_, i64>(4)? != 0,
            created_at: row.get(5)?,
        })
    }
}

const FINDING_COLS: &str = "id, task_id, finding, confidence, promoted, created_at";

impl Store {
    pub fn add_finding(&self, task_id: i64, finding: &str, confidence: f64) -> DaemonResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO exploration_findings (task_id, finding, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, finding, confidence, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_finding(&self, id: i64) -> DaemonResult<Option<ExplorationFinding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLS} FROM exploration_findings WHERE id = ?1"
        ))?;
        let result = stmt
            .query_map(params![id], ExplorationFinding::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    pub fn mark_finding_promoted(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE exploration_findings SET promoted = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// High-confidence findings not surfaced to `session_id` within the
    /// last `suppression_days`, best first.
    pub fn surfaceable_findings(
        &self,
        session_id: i64,
        min_confidence: f64,
        suppression_days: i64,
        limit: usize,
    ) -> DaemonResult<Vec<ExplorationFinding>> {
        let conn = self.conn.lock();
        let cutoff =
            (chrono::Utc::now() - chrono::Duration::days(suppression_days)).to_rfc3339();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLS} FROM exploration_findings f
             WHERE f.confidence >= ?2
               AND NOT EXISTS (
                   SELECT 1 FROM surfaced_findings s
                   WHERE s.finding_id = f.id AND s.session_id = ?1 AND s.surfaced_at >= ?3
               )
             ORDER BY f.confidence DESC, f.created_at DESC
             LIMIT ?4"
        ))?;
        let rows = stmt
            .query_map(
                params![session_id, min_confidence, cutoff, limit as i64],
                ExplorationFinding::from_row,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Record that a finding was injected into a session's context.
    /// Append-only.
    pub fn record_surfaced_finding(&self, finding_id: i64, session_id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO surfaced_findings (finding_id, session_id, surfaced_at)
             VALUES (?1, ?2, ?3)",
            params![finding_id, session_id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_findings(&self, limit: usize) -> DaemonResult<Vec<ExplorationFinding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLS} FROM exploration_findings ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], ExplorationFinding::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::NewTask;

    fn seed_task(store: &Store) -> i64 {
        store
            .enqueue_task(&NewTask {
                title: "explore".into(),
                task_type: "curiosity".into(),
                priority: 5,
                extra: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn surfaced_finding_suppressed_within_window() {
        let store = Store::open_in_memory().unwrap();
        let task = seed_task(&store);
        let finding = store.add_finding(task, "rust iterators fuse", 0.9).unwrap();

        let before = store.surfaceable_findings(42, 0.5, 7, 10).unwrap();
        assert_eq!(before.len(), 1);

        store.record_surfaced_finding(finding, 42).unwrap();
        let after = store.surfaceable_findings(42, 0.5, 7, 10).unwrap();
        assert!(after.is_empty(), "finding surfaced 0d ago must be suppressed");

        // A different session is unaffected
        let other = store.surfaceable_findings(43, 0.5, 7, 10).unwrap();
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn suppression_expires_after_window() {
        let store = Store::open_in_memory().unwrap();
        let task = seed_task(&store);
        let finding = store.add_finding(task, "old news", 0.9).unwrap();
        store.record_surfaced_finding(finding, 42).unwrap();
        // Backdate the surfacing past the window
        {
            let conn = store.conn.lock();
            let past = (chrono::Utc::now() - chrono::Duration::days(8)).to_rfc3339();
            conn.execute(
                "UPDATE surfaced_findings SET surfaced_at = ?1",
                params![past],
            )
            .unwrap();
        }
        let again = store.surfaceable_findings(42, 0.5, 7, 10).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn confidence_floor_applies() {
        let store = Store::open_in_memory().unwrap();
        let task = seed_task(&store);
        store.add_finding(task, "weak hunch", 0.2).unwrap();
        assert!(store.surfaceable_findings(1, 0.5, 7, 10).unwrap().is_empty());
    }
}
