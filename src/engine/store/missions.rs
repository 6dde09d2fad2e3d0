// Missions (scheduled recurring jobs) and their per-run execution records.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::{Mission, MissionExecution};
use rusqlite::params;

const MISSION_COLS: &str = "id, name, schedule, timezone, prompt, personality, allowed_tools, \
                            model, working_dir, sandbox_mode, run_once, enabled, \
                            next_execution_at, last_execution_at, created_at";

impl Mission {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let tools: String = row.get(6)?;
        Ok(Mission {
            id: row.get(0)?,
            name: row.get(1)?,
            schedule: row.get(2)?,
            timezone: row.get(3)?,
            prompt: row.get(4)?,
            personality: row.get(5)?,
            allowed_tools: serde_json::from_str(&tools).unwrap_or_default(),
            model: row.get(7)?,
            working_dir: row.get(8)?,
            sandbox_mode: row.get(9)?,
            run_once: row.get::<_, i64>(10)? != 0,
            enabled: row.get::<_, i64>(11)? != 0,
            next_execution_at: row.get(12)?,
            last_execution_at: row.get(13)?,
            created_at: row.get(14)?,
        })
    }
}

impl MissionExecution {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(MissionExecution {
            id: row.get(0)?,
            mission_id: row.get(1)?,
            status: row.get(2)?,
            trigger: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            output: row.get(6)?,
            tool_count: row.get(7)?,
            error: row.get(8)?,
        })
    }
}

impl Store {
    pub fn create_mission(&self, mission: &Mission) -> DaemonResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO missions (name, schedule, timezone, prompt, personality, allowed_tools,
                                   model, working_dir, sandbox_mode, run_once, enabled,
                                   next_execution_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                mission.name,
                mission.schedule,
                mission.timezone,
                mission.prompt,
                mission.personality,
                serde_json::to_string(&mission.allowed_tools)?,
                mission.model,
                mission.working_dir,
                mission.sandbox_mode,
                mission.run_once as i64,
                mission.enabled as i64,
                mission.next_execution_at,
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_mission(&self, id: i64) -> DaemonResult<Option<Mission>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {MISSION_COLS} FROM missions WHERE id = ?1"))?;
        let result = stmt
            .query_map(params![id], Mission::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    pub fn list_missions(&self) -> DaemonResult<Vec<Mission>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {MISSION_COLS} FROM missions ORDER BY id"))?;
        let rows = stmt
            .query_map([], Mission::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_mission(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM missions WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn set_mission_enabled(&self, id: i64, enabled: bool) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE missions SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        Ok(())
    }

    /// Enabled missions whose `next_execution_at` has passed.
    pub fn due_missions(&self) -> DaemonResult<Vec<Mission>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MISSION_COLS} FROM missions
             WHERE enabled = 1 AND next_execution_at IS NOT NULL AND next_execution_at <= ?1"
        ))?;
        let rows = stmt
            .query_map(params![now_rfc3339()], Mission::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Update execution bookkeeping after a run fires. `run_once` missions
    /// pass `next = None` and are disabled by the scheduler.
    pub fn update_mission_run(
        &self,
        id: i64,
        last_run: &str,
        next: Option<&str>,
    ) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE missions SET last_execution_at = ?2, next_execution_at = ?3 WHERE id = ?1",
            params![id, last_run, next],
        )?;
        Ok(())
    }

    pub fn set_mission_next_execution(&self, id: i64, next: Option<&str>) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE missions SET next_execution_at = ?2 WHERE id = ?1",
            params![id, next],
        )?;
        Ok(())
    }

    // ── Executions ─────────────────────────────────────────────────────

    pub fn start_mission_execution(&self, mission_id: i64, trigger: &str) -> DaemonResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mission_executions (mission_id, status, trigger_type, started_at)
             VALUES (?1, 'running', ?2, ?3)",
            params![mission_id, trigger, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_mission_execution(
        &self,
        execution_id: i64,
        status: &str,
        output: Option<&str>,
        tool_count: i64,
        error: Option<&str>,
    ) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mission_executions
             SET status = ?2, completed_at = ?3, output = ?4, tool_count = ?5, error = ?6
             WHERE id = ?1",
            params![execution_id, status, now_rfc3339(), output, tool_count, error],
        )?;
        Ok(())
    }

    pub fn mission_executions(&self, mission_id: i64, limit: usize) -> DaemonResult<Vec<MissionExecution>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, mission_id, status, trigger_type, started_at, completed_at,
                    output, tool_count, error
             FROM mission_executions WHERE mission_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![mission_id, limit as i64], MissionExecution::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mission(next: Option<&str>) -> Mission {
        Mission {
            id: 0,
            name: "morning digest".into(),
            schedule: "0 9 * * *".into(),
            timezone: "UTC".into(),
            prompt: "Summarize overnight activity".into(),
            personality: None,
            allowed_tools: vec!["read".into()],
            model: None,
            working_dir: None,
            sandbox_mode: None,
            run_once: false,
            enabled: true,
            next_execution_at: next.map(|s| s.to_string()),
            last_execution_at: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn due_missions_respect_next_execution() {
        let store = Store::open_in_memory().unwrap();
        let past = (chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let due = store.create_mission(&test_mission(Some(&past))).unwrap();
        store.create_mission(&test_mission(Some(&future))).unwrap();
        store.create_mission(&test_mission(None)).unwrap();

        let found = store.due_missions().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due);
    }

    #[test]
    fn disabled_missions_never_due() {
        let store = Store::open_in_memory().unwrap();
        let past = (chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        let id = store.create_mission(&test_mission(Some(&past))).unwrap();
        store.set_mission_enabled(id, false).unwrap();
        assert!(store.due_missions().unwrap().is_empty());
    }

    #[test]
    fn execution_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let mid = store.create_mission(&test_mission(None)).unwrap();
        let eid = store.start_mission_execution(mid, "manual").unwrap();
        store
            .finish_mission_execution(eid, "completed", Some("all quiet"), 2, None)
            .unwrap();
        let execs = store.mission_executions(mid, 10).unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].status, "completed");
        assert_eq!(execs[0].trigger, "manual");
        assert_eq!(execs[0].tool_count, 2);
    }
}
