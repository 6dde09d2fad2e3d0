// Database schema and migrations for the dere daemon store.
// Called once at startup by Store::open() after WAL is enabled.
// Migrations are numbered; the applied version lives in PRAGMA user_version
// and each pending migration runs inside one IMMEDIATE transaction (the
// advisory lock). Adding a change: append a new entry to MIGRATIONS —
// never edit an existing one.

use crate::atoms::error::{DaemonError, DaemonResult};
use log::info;
use rusqlite::Connection;

/// Prefix used so startup code can map this failure to exit code 2.
const SCHEMA_MISMATCH: &str = "database schema version";

/// True when the error means the on-disk schema is newer than this build.
pub fn is_schema_mismatch(err: &DaemonError) -> bool {
    matches!(err, DaemonError::Terminal(msg) if msg.starts_with(SCHEMA_MISMATCH))
}

const MIGRATIONS: &[&str] = &[
    // ── v1: full initial schema ─────────────────────────────────────────
    "
    CREATE TABLE sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        working_dir TEXT,
        personality TEXT,
        medium TEXT NOT NULL DEFAULT 'cli',
        created_at TEXT NOT NULL,
        last_activity TEXT NOT NULL,
        ended_at TEXT,
        mission_id INTEGER,
        swarm_id TEXT
    );
    CREATE INDEX idx_sessions_dir ON sessions(working_dir, last_activity DESC);

    CREATE TABLE conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        message_type TEXT NOT NULL,
        prompt TEXT NOT NULL DEFAULT '',
        personality TEXT,
        medium TEXT NOT NULL DEFAULT 'cli',
        timestamp TEXT NOT NULL,
        first_token_ms INTEGER,
        full_ms INTEGER,
        thinking_ms INTEGER,
        tool_uses INTEGER NOT NULL DEFAULT 0,
        tool_names TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX idx_conversations_session ON conversations(session_id, timestamp);

    CREATE TABLE conversation_blocks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        ordinal INTEGER NOT NULL,
        block_type TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        tool_use_id TEXT,
        tool_name TEXT,
        tool_input TEXT,
        is_error INTEGER NOT NULL DEFAULT 0,
        content_embedding BLOB,
        UNIQUE (conversation_id, ordinal)
    );
    CREATE INDEX idx_blocks_conversation ON conversation_blocks(conversation_id, ordinal);
    CREATE INDEX idx_blocks_embedded ON conversation_blocks(block_type)
        WHERE content_embedding IS NOT NULL;

    CREATE TABLE session_summaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        summary TEXT NOT NULL,
        source_conversation_ids TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_summaries_session ON session_summaries(session_id, created_at DESC);

    CREATE TABLE project_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        task_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'ready',
        priority INTEGER NOT NULL DEFAULT 5,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        run_after TEXT,
        extra TEXT NOT NULL DEFAULT '{}',
        outcome TEXT,
        last_error TEXT,
        blocked_by TEXT NOT NULL DEFAULT '[]',
        discovered_from_task_id INTEGER,
        session_id INTEGER,
        model TEXT
    );
    CREATE INDEX idx_tasks_claim ON project_tasks(status, priority, created_at);
    CREATE INDEX idx_tasks_type_status ON project_tasks(task_type, status);

    CREATE TABLE exploration_findings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES project_tasks(id),
        finding TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 0.5,
        promoted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE surfaced_findings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        finding_id INTEGER NOT NULL REFERENCES exploration_findings(id),
        session_id INTEGER NOT NULL,
        surfaced_at TEXT NOT NULL
    );
    CREATE INDEX idx_surfaced ON surfaced_findings(session_id, finding_id, surfaced_at);

    CREATE TABLE ambient_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        phase TEXT NOT NULL DEFAULT 'idle',
        last_transition TEXT NOT NULL,
        next_wake TEXT,
        last_notification_at TEXT,
        consecutive_ignores INTEGER NOT NULL DEFAULT 0,
        escalation_count INTEGER NOT NULL DEFAULT 0,
        valence REAL NOT NULL DEFAULT 0.5,
        arousal REAL NOT NULL DEFAULT 0.5,
        counters_date TEXT NOT NULL DEFAULT '',
        explorations_today INTEGER NOT NULL DEFAULT 0,
        notifications_today INTEGER NOT NULL DEFAULT 0,
        cost_today_microdollars INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE swarms (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        working_dir TEXT NOT NULL DEFAULT '',
        base_branch TEXT NOT NULL DEFAULT 'main',
        branch_prefix TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        auto_synthesize INTEGER NOT NULL DEFAULT 1,
        skip_synthesis_on_failure INTEGER NOT NULL DEFAULT 1,
        synthesis_prompt TEXT,
        supervisor_warn_seconds INTEGER,
        supervisor_cancel_seconds INTEGER,
        synthesis_output TEXT,
        synthesis_summary TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    );

    CREATE TABLE swarm_agents (
        id TEXT PRIMARY KEY,
        swarm_id TEXT NOT NULL REFERENCES swarms(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'worker',
        is_synthesis_agent INTEGER NOT NULL DEFAULT 0,
        mode TEXT,
        prompt TEXT NOT NULL DEFAULT '',
        goal TEXT,
        capabilities TEXT NOT NULL DEFAULT '[]',
        task_types TEXT NOT NULL DEFAULT '[]',
        max_tasks INTEGER,
        max_duration_seconds INTEGER,
        idle_timeout_seconds INTEGER,
        allowed_tools TEXT NOT NULL DEFAULT '[]',
        thinking_budget INTEGER,
        model TEXT,
        sandbox_mode TEXT,
        depends_on TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'pending',
        output TEXT,
        output_summary TEXT,
        error TEXT,
        tool_count INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        completed_at TEXT,
        session_id INTEGER,
        git_branch TEXT,
        UNIQUE (swarm_id, name)
    );
    CREATE INDEX idx_swarm_agents ON swarm_agents(swarm_id, status);

    CREATE TABLE swarm_scratchpad (
        swarm_id TEXT NOT NULL REFERENCES swarms(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (swarm_id, key)
    );

    CREATE TABLE missions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        schedule TEXT NOT NULL,
        timezone TEXT NOT NULL DEFAULT '',
        prompt TEXT NOT NULL DEFAULT '',
        personality TEXT,
        allowed_tools TEXT NOT NULL DEFAULT '[]',
        model TEXT,
        working_dir TEXT,
        sandbox_mode TEXT,
        run_once INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        next_execution_at TEXT,
        last_execution_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE mission_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mission_id INTEGER NOT NULL REFERENCES missions(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'running',
        trigger_type TEXT NOT NULL DEFAULT 'cron',
        started_at TEXT NOT NULL,
        completed_at TEXT,
        output TEXT,
        tool_count INTEGER NOT NULL DEFAULT 0,
        error TEXT
    );
    CREATE INDEX idx_mission_executions ON mission_executions(mission_id, started_at DESC);

    CREATE TABLE workflow_runs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        input TEXT NOT NULL DEFAULT '{}',
        step_results TEXT NOT NULL DEFAULT '{}',
        current_step TEXT,
        status TEXT NOT NULL DEFAULT 'running',
        heartbeat_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_workflow_runs_status ON workflow_runs(status, heartbeat_at);

    CREATE TABLE knowledge_entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT 'concept',
        summary TEXT NOT NULL DEFAULT '',
        source_finding_id INTEGER,
        mention_count INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (name, kind)
    );
    ",
];

pub(crate) fn run_migrations(conn: &Connection) -> DaemonResult<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let known = MIGRATIONS.len() as i64;

    if current > known {
        return Err(DaemonError::Terminal(format!(
            "{SCHEMA_MISMATCH} {current} is newer than this daemon understands ({known})"
        )));
    }
    if current == known {
        return Ok(());
    }

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        // One transaction per migration; SQLite's write lock serializes
        // concurrent starters on it.
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!("[store] Applied migration v{version}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migrations_run_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(run_migrations(&conn).is_ok());
    }

    #[test]
    fn migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert!(run_migrations(&conn).is_ok());
    }

    #[test]
    fn refuses_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.pragma_update(None, "user_version", 9999).unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(is_schema_mismatch(&err), "unexpected error: {err}");
    }

    #[test]
    fn core_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for t in [
            "sessions",
            "conversations",
            "conversation_blocks",
            "session_summaries",
            "project_tasks",
            "exploration_findings",
            "surfaced_findings",
            "ambient_state",
            "swarms",
            "swarm_agents",
            "swarm_scratchpad",
            "missions",
            "mission_executions",
            "workflow_runs",
            "knowledge_entities",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }
    }
}
