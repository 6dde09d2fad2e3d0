// Swarms and swarm agents. Agent status transitions only move forward
// (pending → running → terminal); the store enforces this with guarded
// UPDATEs so a late writer cannot revert a terminal agent.

use super::{now_rfc3339, parse_rfc3339, Store};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{AgentStatus, Swarm, SwarmAgent, SwarmStatus};
use rusqlite::params;
use std::str::FromStr;

const SWARM_COLS: &str = "id, name, working_dir, base_branch, branch_prefix, status, \
                          auto_synthesize, skip_synthesis_on_failure, synthesis_prompt, \
                          supervisor_warn_seconds, supervisor_cancel_seconds, \
                          synthesis_output, synthesis_summary, created_at, started_at, completed_at";

const AGENT_COLS: &str = "id, swarm_id, name, role, is_synthesis_agent, mode, prompt, goal, \
                          capabilities, task_types, max_tasks, max_duration_seconds, \
                          idle_timeout_seconds, allowed_tools, thinking_budget, model, \
                          sandbox_mode, depends_on, status, output, output_summary, error, \
                          tool_count, started_at, completed_at, session_id, git_branch";

impl Swarm {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(5)?;
        Ok(Swarm {
            id: row.get(0)?,
            name: row.get(1)?,
            working_dir: row.get(2)?,
            base_branch: row.get(3)?,
            branch_prefix: row.get(4)?,
            status: SwarmStatus::from_str(&status).unwrap_or(SwarmStatus::Failed),
            auto_synthesize: row.get::<_, i64>(6)? != 0,
            skip_synthesis_on_failure: row.get::<_, i64>(7)? != 0,
            synthesis_prompt: row.get(8)?,
            supervisor_warn_seconds: row.get(9)?,
            supervisor_cancel_seconds: row.get(10)?,
            synthesis_output: row.get(11)?,
            synthesis_summary: row.get(12)?,
            created_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }
}

impl SwarmAgent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let caps: String = row.get(8)?;
        let task_types: String = row.get(9)?;
        let tools: String = row.get(13)?;
        let deps: String = row.get(17)?;
        let status: String = row.get(18)?;
        Ok(SwarmAgent {
            id: row.get(0)?,
            swarm_id: row.get(1)?,
            name: row.get(2)?,
            role: row.get(3)?,
            is_synthesis_agent: row.get::<_, i64>(4)? != 0,
            mode: row.get(5)?,
            prompt: row.get(6)?,
            goal: row.get(7)?,
            capabilities: serde_json::from_str(&caps).unwrap_or_default(),
            task_types: serde_json::from_str(&task_types).unwrap_or_default(),
            max_tasks: row.get(10)?,
            max_duration_seconds: row.get(11)?,
            idle_timeout_seconds: row.get(12)?,
            allowed_tools: serde_json::from_str(&tools).unwrap_or_default(),
            thinking_budget: row.get(14)?,
            model: row.get(15)?,
            sandbox_mode: row.get(16)?,
            depends_on: serde_json::from_str(&deps).unwrap_or_default(),
            status: AgentStatus::from_str(&status).unwrap_or(AgentStatus::Failed),
            output: row.get(19)?,
            output_summary: row.get(20)?,
            error: row.get(21)?,
            tool_count: row.get(22)?,
            started_at: row.get(23)?,
            completed_at: row.get(24)?,
            session_id: row.get(25)?,
            git_branch: row.get(26)?,
        })
    }
}

impl Store {
    // ── Swarm CRUD ─────────────────────────────────────────────────────

    pub fn create_swarm(&self, swarm: &Swarm) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO swarms (id, name, working_dir, base_branch, branch_prefix, status,
                                 auto_synthesize, skip_synthesis_on_failure, synthesis_prompt,
                                 supervisor_warn_seconds, supervisor_cancel_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                swarm.id,
                swarm.name,
                swarm.working_dir,
                swarm.base_branch,
                swarm.branch_prefix,
                swarm.status.as_str(),
                swarm.auto_synthesize as i64,
                swarm.skip_synthesis_on_failure as i64,
                swarm.synthesis_prompt,
                swarm.supervisor_warn_seconds,
                swarm.supervisor_cancel_seconds,
                swarm.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_swarm(&self, id: &str) -> DaemonResult<Option<Swarm>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {SWARM_COLS} FROM swarms WHERE id = ?1"))?;
        let result = stmt
            .query_map(params![id], Swarm::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    pub fn list_swarms(&self, limit: usize) -> DaemonResult<Vec<Swarm>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SWARM_COLS} FROM swarms ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], Swarm::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn set_swarm_status(&self, id: &str, status: SwarmStatus) -> DaemonResult<()> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        match status {
            SwarmStatus::Running => conn.execute(
                "UPDATE swarms SET status = ?2, started_at = COALESCE(started_at, ?3)
                 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?,
            SwarmStatus::Completed | SwarmStatus::Failed | SwarmStatus::Cancelled => conn
                .execute(
                    "UPDATE swarms SET status = ?2, completed_at = COALESCE(completed_at, ?3)
                     WHERE id = ?1",
                    params![id, status.as_str(), now],
                )?,
            SwarmStatus::Pending => conn.execute(
                "UPDATE swarms SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?,
        };
        Ok(())
    }

    pub fn set_swarm_synthesis(&self, id: &str, output: &str, summary: &str) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE swarms SET synthesis_output = ?2, synthesis_summary = ?3 WHERE id = ?1",
            params![id, output, summary],
        )?;
        Ok(())
    }

    /// Swarms still `running` whose start is older than `threshold_hours`
    /// — left behind by a crashed daemon.
    pub fn orphaned_swarms(&self, threshold_hours: i64) -> DaemonResult<Vec<Swarm>> {
        let swarms = self.list_swarms(1000)?;
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(threshold_hours);
        Ok(swarms
            .into_iter()
            .filter(|s| {
                s.status == SwarmStatus::Running
                    && s.started_at
                        .as_deref()
                        .map(|t| parse_rfc3339(t) < cutoff)
                        .unwrap_or(true)
            })
            .collect())
    }

    // ── Swarm agents ───────────────────────────────────────────────────

    pub fn add_swarm_agent(&self, agent: &SwarmAgent) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO swarm_agents
                 (id, swarm_id, name, role, is_synthesis_agent, mode, prompt, goal,
                  capabilities, task_types, max_tasks, max_duration_seconds,
                  idle_timeout_seconds, allowed_tools, thinking_budget, model,
                  sandbox_mode, depends_on, status, tool_count, session_id, git_branch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                agent.id,
                agent.swarm_id,
                agent.name,
                agent.role,
                agent.is_synthesis_agent as i64,
                agent.mode,
                agent.prompt,
                agent.goal,
                serde_json::to_string(&agent.capabilities)?,
                serde_json::to_string(&agent.task_types)?,
                agent.max_tasks,
                agent.max_duration_seconds,
                agent.idle_timeout_seconds,
                serde_json::to_string(&agent.allowed_tools)?,
                agent.thinking_budget,
                agent.model,
                agent.sandbox_mode,
                serde_json::to_string(&agent.depends_on)?,
                agent.status.as_str(),
                agent.tool_count,
                agent.session_id,
                agent.git_branch,
            ],
        )?;
        Ok(())
    }

    pub fn swarm_agents(&self, swarm_id: &str) -> DaemonResult<Vec<SwarmAgent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLS} FROM swarm_agents WHERE swarm_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![swarm_id], SwarmAgent::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn get_swarm_agent(&self, agent_id: &str) -> DaemonResult<Option<SwarmAgent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLS} FROM swarm_agents WHERE id = ?1"
        ))?;
        let result = stmt
            .query_map(params![agent_id], SwarmAgent::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    /// Forward-only status transition; rejects reverts.
    pub fn set_agent_status(&self, agent_id: &str, next: AgentStatus) -> DaemonResult<()> {
        let current = self
            .get_swarm_agent(agent_id)?
            .ok_or_else(|| DaemonError::Validation(format!("no swarm agent {agent_id}")))?
            .status;
        if !current.can_transition_to(next) {
            return Err(DaemonError::Validation(format!(
                "illegal agent transition {current} → {next}"
            )));
        }
        let conn = self.conn.lock();
        let now = now_rfc3339();
        match next {
            AgentStatus::Running => conn.execute(
                "UPDATE swarm_agents SET status = ?2, started_at = ?3 WHERE id = ?1",
                params![agent_id, next.as_str(), now],
            )?,
            _ => conn.execute(
                "UPDATE swarm_agents SET status = ?2, completed_at = ?3 WHERE id = ?1",
                params![agent_id, next.as_str(), now],
            )?,
        };
        Ok(())
    }

    pub fn set_agent_result(
        &self,
        agent_id: &str,
        output: &str,
        output_summary: Option<&str>,
        tool_count: i64,
    ) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE swarm_agents SET output = ?2, output_summary = ?3, tool_count = ?4
             WHERE id = ?1",
            params![agent_id, output, output_summary, tool_count],
        )?;
        Ok(())
    }

    pub fn set_agent_error(&self, agent_id: &str, error: &str) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE swarm_agents SET error = ?2 WHERE id = ?1",
            params![agent_id, error],
        )?;
        Ok(())
    }

    pub fn set_agent_session(&self, agent_id: &str, session_id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE swarm_agents SET session_id = ?2 WHERE id = ?1",
            params![agent_id, session_id],
        )?;
        Ok(())
    }

    pub fn set_agent_branch(&self, agent_id: &str, branch: &str) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE swarm_agents SET git_branch = ?2 WHERE id = ?1",
            params![agent_id, branch],
        )?;
        Ok(())
    }
}
