// Exploration workflows: one curiosity task explored end-to-end
// (getTaskById → runExploration → persistResult → spawnFollowUps →
// storeFindings), plus the sequential batch variant. The STARTER claims
// the task before the workflow begins, which makes the first step a
// trivially idempotent lookup and leaves crash recovery to the stale
// sweep if the engine loses state in between.

use super::{finish_run, run_step, start_run};
use crate::atoms::constants::BATCH_INTER_TASK_DELAY_SECS;
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{TaskRecord, TaskStatus};
use crate::engine::clients::llm::estimate_cost_microdollars;
use crate::engine::events::EngineEvent;
use crate::engine::state::DaemonState;
use crate::engine::store::NewTask;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Cap on follow-up curiosity tasks spawned per exploration.
const MAX_FOLLOW_UPS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExplorationOutcome {
    pub summary: String,
    pub finding_ids: Vec<i64>,
    pub follow_up_task_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ExplorationText {
    text: String,
    eval_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ParsedExploration {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    findings: Vec<ParsedFinding>,
    #[serde(default)]
    follow_ups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ParsedFinding {
    text: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Tolerant parse of the model reply: find the outermost JSON object;
/// fall back to treating the whole reply as one medium-confidence finding.
fn parse_exploration(reply: &str) -> ParsedExploration {
    let parsed = reply
        .find('{')
        .and_then(|start| reply.rfind('}').filter(|end| *end > start).map(|end| (start, end)))
        .and_then(|(start, end)| serde_json::from_str::<ParsedExploration>(&reply[start..=end]).ok());
    match parsed {
        Some(p) if !p.findings.is_empty() || !p.summary.is_empty() => p,
        _ => ParsedExploration {
            summary: String::new(),
            findings: vec![ParsedFinding {
                text: reply.trim().to_string(),
                confidence: 0.4,
            }],
            follow_ups: vec![],
        },
    }
}

/// Run the exploration workflow for an ALREADY-CLAIMED curiosity task.
pub async fn explore_claimed(
    state: &Arc<DaemonState>,
    task: &TaskRecord,
) -> DaemonResult<ExplorationOutcome> {
    let run_id = start_run(state, "exploration", &serde_json::json!({"task_id": task.id}))?;
    drive(state, &run_id, task.id).await
}

/// Resume an exploration run after restart or lost heartbeat.
pub async fn resume(
    state: &Arc<DaemonState>,
    run_id: &str,
    task_id: i64,
) -> DaemonResult<ExplorationOutcome> {
    drive(state, run_id, task_id).await
}

async fn drive(
    state: &Arc<DaemonState>,
    run_id: &str,
    task_id: i64,
) -> DaemonResult<ExplorationOutcome> {
    match steps(state, run_id, task_id).await {
        Ok(outcome) => {
            finish_run(state, run_id, "completed");
            Ok(outcome)
        }
        Err(err) => {
            if matches!(err, DaemonError::Cancelled(_)) {
                // Cancellation here means the heartbeat monitor handed
                // the run to a fresh executor; leave the task claimed and
                // the run row alone for it.
                return Err(err);
            }
            // Release the claimed task unless the failure is explicitly
            // terminal; terminal failures consume the task.
            if err.retryable() {
                if let Err(e) = state.store.release_task(task_id) {
                    warn!("[exploration] Could not release task {task_id}: {e}");
                }
            } else if let Err(e) = state.store.fail_task(task_id, &err.to_string(), false) {
                warn!("[exploration] Could not fail task {task_id}: {e}");
            }
            finish_run(state, run_id, "failed");
            Err(err)
        }
    }
}

async fn steps(
    state: &Arc<DaemonState>,
    run_id: &str,
    task_id: i64,
) -> DaemonResult<ExplorationOutcome> {
    // ── getTaskById ────────────────────────────────────────────────────
    let task: TaskRecord = run_step(state, run_id, "getTaskById", async {
        state
            .store
            .get_task(task_id)?
            .ok_or_else(|| DaemonError::Validation(format!("no task {task_id}")))
    })
    .await?;

    // ── runExploration ─────────────────────────────────────────────────
    let model = task
        .model
        .clone()
        .unwrap_or_else(|| state.config.ambient_model.clone());
    let exploration: ExplorationText = run_step(state, run_id, "runExploration", async {
        let trigger = task.extra["trigger"].as_str().unwrap_or("curiosity");
        let access = if state.config.exploration_write {
            "You may propose concrete changes."
        } else {
            "This is a read-only investigation; observe and report, do not propose mutations."
        };
        let prompt = format!(
            "You are exploring a topic autonomously on the user's behalf \
             (trigger: {trigger}). {access}\nTopic: {}\n\nContext: {}\n\n\
             Investigate and reply with ONLY a JSON object: \
             {{\"summary\": \"...\", \
               \"findings\": [{{\"text\": \"...\", \"confidence\": 0.0}}], \
               \"follow_ups\": [\"further topic\"]}}",
            task.title, task.description
        );
        let result = state.llm.generate(&model, None, &prompt).await?;
        Ok(ExplorationText {
            text: result.text,
            eval_tokens: result.eval_tokens,
        })
    })
    .await?;

    let parsed = parse_exploration(&exploration.text);

    // ── persistResult ──────────────────────────────────────────────────
    let summary = parsed.summary.clone();
    run_step(state, run_id, "persistResult", async {
        // Idempotent under resume: a previous executor may have already
        // completed the task before crashing.
        let current = state.store.get_task(task_id)?;
        if current.map(|t| t.status) == Some(TaskStatus::InProgress) {
            let outcome = if summary.is_empty() {
                format!("explored ({} findings)", parsed.findings.len())
            } else {
                summary.clone()
            };
            state.store.complete_task(task_id, &outcome)?;
        }
        let cost = estimate_cost_microdollars(exploration.eval_tokens);
        state.daily_budget.record(exploration.eval_tokens.max(0) as u64, cost.max(0) as u64);
        state.store.add_exploration_cost(cost)?;
        let mut ambient = state.store.ambient_state()?;
        ambient.explorations_today += 1;
        state.store.save_ambient_state(&ambient)?;
        Ok(())
    })
    .await?;

    // ── spawnFollowUps ─────────────────────────────────────────────────
    let follow_ups = parsed.follow_ups.clone();
    let parent_priority = task.priority;
    let follow_up_task_ids: Vec<i64> = run_step(state, run_id, "spawnFollowUps", async {
        let mut ids = Vec::new();
        for topic in follow_ups.iter().take(MAX_FOLLOW_UPS) {
            if topic.trim().is_empty() {
                continue;
            }
            let id = state.store.enqueue_task(&NewTask {
                title: topic.trim().to_string(),
                description: format!("Follow-up from exploring: {}", task.title),
                task_type: "curiosity".into(),
                priority: parent_priority,
                extra: serde_json::json!({
                    "trigger": "follow_up",
                    "exploration_count": task.extra["exploration_count"].as_i64().unwrap_or(0) + 1,
                }),
                discovered_from_task_id: Some(task_id),
                ..Default::default()
            })?;
            ids.push(id);
        }
        Ok(ids)
    })
    .await?;

    // ── storeFindings ──────────────────────────────────────────────────
    let findings = parsed.findings;
    let finding_ids: Vec<i64> = run_step(state, run_id, "storeFindings", async {
        let mut ids = Vec::new();
        for finding in &findings {
            if finding.text.trim().is_empty() {
                continue;
            }
            let confidence = finding.confidence.clamp(0.0, 1.0);
            let id = state
                .store
                .add_finding(task_id, finding.text.trim(), confidence)?;
            // High-confidence findings promote into the knowledge graph.
            if confidence >= 0.8 {
                state
                    .store
                    .upsert_entity(&task.title, "topic", finding.text.trim(), Some(id))?;
                state.store.mark_finding_promoted(id)?;
            }
            state.events.emit(EngineEvent::FindingStored {
                task_id,
                finding_id: id,
            });
            ids.push(id);
        }
        Ok(ids)
    })
    .await?;

    info!(
        "[exploration] Task {task_id} explored: {} findings, {} follow-ups",
        finding_ids.len(),
        follow_up_task_ids.len()
    );
    Ok(ExplorationOutcome {
        summary: parsed.summary,
        finding_ids,
        follow_up_task_ids,
    })
}

// ── Batch exploration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchOutcome {
    pub completed: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Process several ALREADY-CLAIMED curiosity tasks sequentially with an
/// inter-task delay. Individual failures are recorded and the batch
/// continues.
pub async fn explore_batch(
    state: &Arc<DaemonState>,
    task_ids: &[i64],
) -> DaemonResult<BatchOutcome> {
    let run_id = start_run(
        state,
        "batch_exploration",
        &serde_json::json!({"task_ids": task_ids}),
    )?;
    batch_steps(state, &run_id, task_ids.to_vec()).await
}

pub async fn resume_batch(
    state: &Arc<DaemonState>,
    run_id: &str,
    task_ids: Vec<i64>,
) -> DaemonResult<BatchOutcome> {
    batch_steps(state, run_id, task_ids).await
}

async fn batch_steps(
    state: &Arc<DaemonState>,
    run_id: &str,
    task_ids: Vec<i64>,
) -> DaemonResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let total = task_ids.len();
    for (index, task_id) in task_ids.into_iter().enumerate() {
        let step_name = format!("task-{task_id}");
        let succeeded: bool = run_step(state, run_id, &step_name, async {
            // Each iteration is an exploration workflow of its own.
            let task = match state.store.get_task(task_id)? {
                Some(t) => t,
                None => return Ok(false),
            };
            match explore_claimed(state, &task).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!("[exploration] Batch item {task_id} failed: {e}");
                    Ok(false)
                }
            }
        })
        .await?;
        if succeeded {
            outcome.completed.push(task_id);
        } else {
            outcome.failed.push(task_id);
        }
        if index + 1 < total {
            tokio::time::sleep(Duration::from_secs(BATCH_INTER_TASK_DELAY_SECS)).await;
        }
    }
    finish_run(state, run_id, "completed");
    info!(
        "[exploration] Batch done: {} completed, {} failed",
        outcome.completed.len(),
        outcome.failed.len()
    );
    Ok(outcome)
}
