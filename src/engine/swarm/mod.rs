// ── dere engine: Swarm Coordinator ─────────────────────────────────────────
// Launches multiple concurrent sub-agents with a dependency DAG, isolated
// git branches, a scratchpad mailbox, and an optional synthesis step.
//
// Scheduling: an agent is eligible once every dependency is terminal and
// its condition holds; up to MAX_PARALLEL_AGENTS run concurrently; the
// synthesis agent never runs before all other agents are terminal. A
// supervisor loop warns and then cancels a swarm that overstays its
// configured budget.

pub mod agent;
pub mod git;

use crate::atoms::constants::{MAX_PARALLEL_AGENTS, SWARM_ORPHAN_HOURS, SWARM_TICK_SECS};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{AgentStatus, Swarm, SwarmAgent, SwarmStatus};
use crate::engine::cancel::CancelToken;
use crate::engine::events::EngineEvent;
use crate::engine::state::DaemonState;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Pre-flight validation: every named dependency exists and the graph is
/// acyclic. Rejected swarms never start.
pub fn validate_dependencies(agents: &[SwarmAgent]) -> DaemonResult<()> {
    let names: HashSet<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    for agent in agents {
        for dep in &agent.depends_on {
            if dep.agent == agent.name {
                return Err(DaemonError::Validation(format!(
                    "agent '{}' depends on itself",
                    agent.name
                )));
            }
            if !names.contains(dep.agent.as_str()) {
                return Err(DaemonError::Validation(format!(
                    "agent '{}' depends on unknown agent '{}'",
                    agent.name, dep.agent
                )));
            }
        }
    }

    // Cycle check: DFS with white/grey/black coloring over agent names.
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }
    let edges: HashMap<&str, Vec<&str>> = agents
        .iter()
        .map(|a| {
            (
                a.name.as_str(),
                a.depends_on.iter().map(|d| d.agent.as_str()).collect(),
            )
        })
        .collect();
    let mut colors: HashMap<&str, Color> = names.iter().map(|n| (*n, Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> bool {
        colors.insert(node, Color::Grey);
        for next in edges.get(node).into_iter().flatten() {
            match colors.get(next).copied().unwrap_or(Color::White) {
                Color::Grey => return false,
                Color::White => {
                    if !visit(next, edges, colors) {
                        return false;
                    }
                }
                Color::Black => {}
            }
        }
        colors.insert(node, Color::Black);
        true
    }

    for name in &names {
        if colors[name] == Color::White && !visit(name, &edges, &mut colors) {
            return Err(DaemonError::Validation(
                "dependency graph contains a cycle".into(),
            ));
        }
    }
    Ok(())
}

fn cancel_key(swarm_id: &str) -> String {
    format!("swarm:{swarm_id}")
}

/// Request cancellation of a running swarm.
pub fn request_cancel(state: &Arc<DaemonState>, swarm_id: &str) -> bool {
    match state.workflow_cancels.lock().get(&cancel_key(swarm_id)) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    }
}

/// Kick off a swarm in the background. Validation failures surface to the
/// caller before anything is marked running.
pub fn start(state: &Arc<DaemonState>, swarm_id: &str) -> DaemonResult<()> {
    let swarm = state
        .store
        .get_swarm(swarm_id)?
        .ok_or_else(|| DaemonError::Validation(format!("no swarm {swarm_id}")))?;
    if swarm.status != SwarmStatus::Pending {
        return Err(DaemonError::Validation(format!(
            "swarm {swarm_id} is {:?}, not pending",
            swarm.status
        )));
    }
    let agents = state.store.swarm_agents(swarm_id)?;
    if agents.is_empty() {
        return Err(DaemonError::Validation("swarm has no agents".into()));
    }
    validate_dependencies(&agents)?;

    let state = state.clone();
    let swarm_id = swarm_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_swarm(&state, &swarm_id).await {
            warn!("[swarm] Swarm {swarm_id} failed: {e}");
        }
    });
    Ok(())
}

/// The swarm workflow: branch pre-flight, dependency-ordered fan-out,
/// synthesis, finalization.
pub async fn run_swarm(state: &Arc<DaemonState>, swarm_id: &str) -> DaemonResult<SwarmStatus> {
    let swarm = state
        .store
        .get_swarm(swarm_id)?
        .ok_or_else(|| DaemonError::Validation(format!("no swarm {swarm_id}")))?;
    let agents = state.store.swarm_agents(swarm_id)?;

    // ── Pre-flight: per-agent git branches ─────────────────────────────
    if let Some(prefix) = swarm.branch_prefix.as_deref() {
        for agent in agents.iter().filter(|a| !a.is_synthesis_agent) {
            let branch = format!("{prefix}{}", agent.name);
            match git::create_branch(&swarm.working_dir, &swarm.base_branch, &branch).await {
                Ok(()) => {
                    state.store.set_agent_branch(&agent.id, &branch)?;
                }
                Err(e) => warn!("[swarm] Branch creation for '{}' failed: {e}", agent.name),
            }
        }
    }

    let cancel = CancelToken::new();
    state
        .workflow_cancels
        .lock()
        .insert(cancel_key(swarm_id), cancel.clone());

    state.store.set_swarm_status(swarm_id, SwarmStatus::Running)?;
    state.events.emit(EngineEvent::SwarmStart {
        swarm_id: swarm_id.to_string(),
    });
    let run_id = crate::engine::workflow::start_run(
        state,
        "swarm",
        &serde_json::json!({"swarm_id": swarm_id}),
    )?;

    // Liveness for the durable run, covering fan-out and synthesis both.
    let hb_state = state.clone();
    let hb_run = run_id.clone();
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(
                crate::atoms::constants::HEARTBEAT_INTERVAL_SECS,
            ))
            .await;
            if hb_state.store.heartbeat_workflow(&hb_run).is_err() {
                break;
            }
        }
    });
    let status = drive(state, &swarm, &cancel).await;
    heartbeat.abort();
    let final_status = match status {
        Ok(s) => s,
        Err(ref e) => {
            warn!("[swarm] Coordinator error for {swarm_id}: {e}");
            SwarmStatus::Failed
        }
    };
    state.store.set_swarm_status(swarm_id, final_status)?;
    crate::engine::workflow::finish_run(
        state,
        &run_id,
        match final_status {
            SwarmStatus::Completed => "completed",
            SwarmStatus::Cancelled => "cancelled",
            _ => "failed",
        },
    );
    state.workflow_cancels.lock().remove(&cancel_key(swarm_id));
    state.events.emit(EngineEvent::SwarmFinished {
        swarm_id: swarm_id.to_string(),
        status: final_status.as_str().to_string(),
    });
    info!("[swarm] Swarm {swarm_id} finished: {}", final_status.as_str());
    status
}

async fn drive(
    state: &Arc<DaemonState>,
    swarm: &Swarm,
    cancel: &CancelToken,
) -> DaemonResult<SwarmStatus> {
    let started = chrono::Utc::now();
    let mut launched: HashSet<String> = HashSet::new();
    let mut warned = false;

    // ── Fan-out loop ───────────────────────────────────────────────────
    loop {
        if cancel.is_cancelled() {
            cancel_pending_agents(state, &swarm.id)?;
            return Ok(SwarmStatus::Cancelled);
        }

        let agents = state.store.swarm_agents(&swarm.id)?;
        let workers: Vec<&SwarmAgent> =
            agents.iter().filter(|a| !a.is_synthesis_agent).collect();

        if workers.iter().all(|a| a.status.is_terminal()) {
            break;
        }

        let by_name: HashMap<&str, AgentStatus> =
            agents.iter().map(|a| (a.name.as_str(), a.status)).collect();
        let running = workers
            .iter()
            .filter(|a| a.status == AgentStatus::Running)
            .count();
        let mut slots = MAX_PARALLEL_AGENTS.saturating_sub(running);

        for candidate in &workers {
            if candidate.status != AgentStatus::Pending || launched.contains(&candidate.id) {
                continue;
            }
            let deps_terminal = candidate
                .depends_on
                .iter()
                .all(|d| by_name.get(d.agent.as_str()).is_some_and(|s| s.is_terminal()));
            if !deps_terminal {
                continue;
            }
            let conditions_met = candidate.depends_on.iter().all(|d| {
                by_name
                    .get(d.agent.as_str())
                    .is_some_and(|s| d.condition.satisfied_by(*s))
            });
            if !conditions_met {
                // Dependencies settled the wrong way; this agent never runs.
                state
                    .store
                    .set_agent_status(&candidate.id, AgentStatus::Skipped)?;
                state.events.emit(EngineEvent::SwarmAgentStatus {
                    swarm_id: swarm.id.clone(),
                    agent: candidate.name.clone(),
                    status: "skipped".into(),
                });
                continue;
            }
            if slots == 0 {
                continue;
            }
            slots -= 1;
            launched.insert(candidate.id.clone());
            let state = state.clone();
            let swarm = swarm.clone();
            let agent = (*candidate).clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                agent::run_agent(&state, &swarm, &agent, &cancel).await;
            });
        }

        // ── Supervisor ─────────────────────────────────────────────────
        let elapsed = (chrono::Utc::now() - started).num_seconds();
        if let Some(warn_at) = swarm.supervisor_warn_seconds {
            if !warned && elapsed >= warn_at {
                warned = true;
                warn!("[swarm] Swarm {} over warn budget ({elapsed}s)", swarm.id);
                state.events.emit(EngineEvent::SwarmSupervisorWarning {
                    swarm_id: swarm.id.clone(),
                    elapsed_seconds: elapsed,
                });
            }
        }
        if let Some(cancel_at) = swarm.supervisor_cancel_seconds {
            if elapsed >= cancel_at {
                warn!("[swarm] Swarm {} over cancel budget ({elapsed}s) — cancelling", swarm.id);
                cancel.cancel();
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(SWARM_TICK_SECS)) => {}
        }
    }

    // ── Synthesis ──────────────────────────────────────────────────────
    let agents = state.store.swarm_agents(&swarm.id)?;
    let any_failed = agents
        .iter()
        .filter(|a| !a.is_synthesis_agent)
        .any(|a| matches!(a.status, AgentStatus::Failed | AgentStatus::TimedOut));

    if swarm.auto_synthesize && (!any_failed || !swarm.skip_synthesis_on_failure) {
        if let Some(synthesis) = agents.iter().find(|a| a.is_synthesis_agent) {
            agent::run_synthesis(state, swarm, synthesis, &agents, cancel).await;
        } else {
            agent::run_inline_synthesis(state, swarm, &agents).await;
        }
    }

    // ── Final status ───────────────────────────────────────────────────
    let agents = state.store.swarm_agents(&swarm.id)?;
    if cancel.is_cancelled() {
        return Ok(SwarmStatus::Cancelled);
    }
    if agents
        .iter()
        .filter(|a| !a.is_synthesis_agent)
        .any(|a| matches!(a.status, AgentStatus::Failed | AgentStatus::TimedOut))
    {
        Ok(SwarmStatus::Failed)
    } else {
        Ok(SwarmStatus::Completed)
    }
}

fn cancel_pending_agents(state: &Arc<DaemonState>, swarm_id: &str) -> DaemonResult<()> {
    for agent in state.store.swarm_agents(swarm_id)? {
        if !agent.status.is_terminal() && agent.status == AgentStatus::Pending {
            state
                .store
                .set_agent_status(&agent.id, AgentStatus::Cancelled)?;
        }
    }
    Ok(())
}

/// Merge successful agents' branches into `target` sequentially, stopping
/// at the first conflict. Returns (merged branch names, conflict).
pub async fn merge_branches(
    state: &Arc<DaemonState>,
    swarm_id: &str,
    target: &str,
) -> DaemonResult<(Vec<String>, Option<String>)> {
    let swarm = state
        .store
        .get_swarm(swarm_id)?
        .ok_or_else(|| DaemonError::Validation(format!("no swarm {swarm_id}")))?;
    let agents = state.store.swarm_agents(swarm_id)?;
    let mut merged = Vec::new();
    for agent in agents {
        let Some(branch) = agent.git_branch.clone() else {
            continue;
        };
        if agent.status != AgentStatus::Completed {
            continue;
        }
        match git::merge_branch(&swarm.working_dir, target, &branch).await {
            Ok(()) => merged.push(branch),
            Err(e) => {
                warn!("[swarm] Merge stopped at '{branch}': {e}");
                return Ok((merged, Some(format!("{branch}: {e}"))));
            }
        }
    }
    Ok((merged, None))
}

/// Startup sweep: swarms left `running` from a dead daemon are failed as
/// orphaned, along with their non-terminal agents.
pub fn cleanup_orphans(state: &Arc<DaemonState>) {
    let orphans = match state.store.orphaned_swarms(SWARM_ORPHAN_HOURS) {
        Ok(o) => o,
        Err(e) => {
            warn!("[swarm] Orphan sweep failed: {e}");
            return;
        }
    };
    for swarm in orphans {
        warn!("[swarm] Failing orphaned swarm {} ({})", swarm.id, swarm.name);
        if let Ok(agents) = state.store.swarm_agents(&swarm.id) {
            for agent in agents {
                if !agent.status.is_terminal() {
                    let _ = state.store.set_agent_error(&agent.id, "orphaned");
                    let _ = state.store.set_agent_status(&agent.id, AgentStatus::Failed);
                }
            }
        }
        let _ = state.store.set_swarm_status(&swarm.id, SwarmStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AgentDependency, DependencyCondition};
    use crate::engine::store::fixtures::{test_agent, test_swarm};

    fn dep(name: &str, condition: DependencyCondition) -> AgentDependency {
        AgentDependency {
            agent: name.into(),
            include: true,
            condition,
        }
    }

    #[test]
    fn self_dependency_rejected() {
        let mut a = test_agent("s", "a");
        a.depends_on = vec![dep("a", DependencyCondition::OnSuccess)];
        let err = validate_dependencies(&[a]).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut a = test_agent("s", "a");
        a.depends_on = vec![dep("ghost", DependencyCondition::OnSuccess)];
        assert!(validate_dependencies(&[a]).is_err());
    }

    #[test]
    fn cycle_rejected() {
        let mut a = test_agent("s", "a");
        let mut b = test_agent("s", "b");
        let mut c = test_agent("s", "c");
        a.depends_on = vec![dep("c", DependencyCondition::OnAny)];
        b.depends_on = vec![dep("a", DependencyCondition::OnAny)];
        c.depends_on = vec![dep("b", DependencyCondition::OnAny)];
        let err = validate_dependencies(&[a, b, c]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn diamond_dag_accepted() {
        let root = test_agent("s", "root");
        let mut left = test_agent("s", "left");
        let mut right = test_agent("s", "right");
        let mut join = test_agent("s", "join");
        left.depends_on = vec![dep("root", DependencyCondition::OnSuccess)];
        right.depends_on = vec![dep("root", DependencyCondition::OnSuccess)];
        join.depends_on = vec![
            dep("left", DependencyCondition::OnSuccess),
            dep("right", DependencyCondition::OnSuccess),
        ];
        assert!(validate_dependencies(&[root, left, right, join]).is_ok());
    }

    #[test]
    fn start_rejects_invalid_swarm_before_running() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let state = Arc::new(DaemonState::for_testing());
            state.store.create_swarm(&test_swarm("bad")).unwrap();
            let mut a = test_agent("bad", "a");
            a.depends_on = vec![dep("a", DependencyCondition::OnSuccess)];
            state.store.add_swarm_agent(&a).unwrap();

            assert!(start(&state, "bad").is_err());
            let swarm = state.store.get_swarm("bad").unwrap().unwrap();
            assert_eq!(swarm.status, SwarmStatus::Pending);
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependency_gating_skips_downstream_of_failure() {
        // No model server is reachable in tests, so every agent's LLM
        // call fails; the interesting part is the scheduler: impl-b
        // depends on impl-a with on_success, so once impl-a fails,
        // impl-b must be skipped and the swarm failed.
        let state = Arc::new(DaemonState::for_testing());
        let mut swarm = test_swarm("gated");
        swarm.supervisor_warn_seconds = None;
        swarm.supervisor_cancel_seconds = Some(120);
        state.store.create_swarm(&swarm).unwrap();
        state.store.add_swarm_agent(&test_agent("gated", "impl-a")).unwrap();
        let mut b = test_agent("gated", "impl-b");
        b.depends_on = vec![dep("impl-a", DependencyCondition::OnSuccess)];
        state.store.add_swarm_agent(&b).unwrap();

        let status = tokio::time::timeout(
            std::time::Duration::from_secs(90),
            run_swarm(&state, "gated"),
        )
        .await
        .expect("swarm must settle well before the supervisor budget")
        .unwrap();
        assert_eq!(status, SwarmStatus::Failed);

        let agents = state.store.swarm_agents("gated").unwrap();
        let a = agents.iter().find(|x| x.name == "impl-a").unwrap();
        let b = agents.iter().find(|x| x.name == "impl-b").unwrap();
        assert_eq!(a.status, AgentStatus::Failed);
        assert!(a.error.is_some());
        assert_eq!(b.status, AgentStatus::Skipped);

        let stored = state.store.get_swarm("gated").unwrap().unwrap();
        assert_eq!(stored.status, SwarmStatus::Failed);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn orphan_cleanup_fails_stuck_swarms() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let state = Arc::new(DaemonState::for_testing());
            state.store.create_swarm(&test_swarm("stuck")).unwrap();
            let agent = test_agent("stuck", "a");
            state.store.add_swarm_agent(&agent).unwrap();
            state
                .store
                .set_swarm_status("stuck", SwarmStatus::Running)
                .unwrap();
            state
                .store
                .set_agent_status(&agent.id, AgentStatus::Running)
                .unwrap();
            {
                let conn = state.store.conn.lock();
                let past = (chrono::Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
                conn.execute(
                    "UPDATE swarms SET started_at = ?1 WHERE id = 'stuck'",
                    rusqlite::params![past],
                )
                .unwrap();
            }

            cleanup_orphans(&state);
            let swarm = state.store.get_swarm("stuck").unwrap().unwrap();
            assert_eq!(swarm.status, SwarmStatus::Failed);
            let agent = state.store.get_swarm_agent(&agent.id).unwrap().unwrap();
            assert_eq!(agent.status, AgentStatus::Failed);
            assert_eq!(agent.error.as_deref(), Some("orphaned"));
        });
    }
}
