// ── dere engine: Storage Layer ─────────────────────────────────────────────
// Single SQLite database behind a Mutex<Connection>; the sole source of
// truth for every entity. In-memory caches elsewhere are reconstructible
// from here.
//
// Module layout:
//   schema       — versioned migrations (PRAGMA user_version)
//   sessions     — sessions, conversations, conversation blocks
//                  (including the embedding BLOB codec + similarity scan)
//   summaries    — session summaries + related-session lookup
//   tasks        — durable task queue (enqueue/claim/complete/fail/stale)
//   findings     — exploration findings + surfaced-finding suppression
//   ambient      — ambient FSM singleton row + daily counters
//   swarms       — swarms + swarm agents
//   scratchpad   — swarm-scoped KV store (mailbox bus)
//   missions     — missions + executions
//   workflows    — durable workflow runs
//   knowledge    — knowledge-graph entities

use crate::atoms::error::DaemonResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod ambient;
mod findings;
mod knowledge;
mod missions;
mod schema;
mod scratchpad;
mod sessions;
mod summaries;
mod swarms;
mod tasks;
mod workflows;

pub use schema::is_schema_mismatch;
pub use sessions::SimilarBlock;
pub use tasks::NewTask;

/// Thread-safe database wrapper. Write transactions are short; no lock is
/// held across an await point.
pub struct Store {
    /// The SQLite connection, protected by a Mutex.
    /// `pub(crate)` for tests that construct an in-memory store.
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database and apply migrations.
    pub fn open(path: &Path) -> DaemonResult<Self> {
        info!("[store] Opening database at {:?}", path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        conn.execute_batch("PRAGMA busy_timeout=5000;").ok();

        schema::run_migrations(&conn)?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store with the full schema, for tests.
    pub fn open_in_memory() -> DaemonResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }
}

/// Shared fixtures for swarm-related tests across modules.
#[cfg(test)]
pub(crate) mod fixtures {
    use crate::atoms::types::{AgentStatus, Swarm, SwarmAgent, SwarmStatus};

    pub(crate) fn test_swarm(id: &str) -> Swarm {
        Swarm {
            id: id.into(),
            name: "review swarm".into(),
            working_dir: "/tmp/repo".into(),
            base_branch: "main".into(),
            branch_prefix: None,
            status: SwarmStatus::Pending,
            auto_synthesize: true,
            skip_synthesis_on_failure: true,
            synthesis_prompt: None,
            supervisor_warn_seconds: Some(600),
            supervisor_cancel_seconds: Some(1200),
            synthesis_output: None,
            synthesis_summary: None,
            created_at: super::now_rfc3339(),
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn test_agent(swarm_id: &str, name: &str) -> SwarmAgent {
        SwarmAgent {
            id: format!("{swarm_id}-{name}"),
            swarm_id: swarm_id.into(),
            name: name.into(),
            role: "worker".into(),
            is_synthesis_agent: false,
            mode: None,
            prompt: format!("You are {name}."),
            goal: None,
            capabilities: vec![],
            task_types: vec![],
            max_tasks: None,
            max_duration_seconds: None,
            idle_timeout_seconds: None,
            allowed_tools: vec![],
            thinking_budget: None,
            model: None,
            sandbox_mode: None,
            depends_on: vec![],
            status: AgentStatus::Pending,
            output: None,
            output_summary: None,
            error: None,
            tool_count: 0,
            started_at: None,
            completed_at: None,
            session_id: None,
            git_branch: None,
        }
    }
}

/// Current wall-clock time as an RFC 3339 UTC string.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 string; invalid input maps to the UNIX epoch so
/// comparisons degrade safely instead of panicking.
pub(crate) fn parse_rfc3339(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
}
