// Curiosity backlog management. Items are `curiosity` task records whose
// `extra` carries trigger type, interest factors, and exploration stats.
// Priority is recomputed from the stored factors on enqueue; each FSM
// tick garbage-collects low-score and expired items and enforces the
// total and per-trigger caps.

use crate::atoms::constants::{
    BACKLOG_CAP_PER_TRIGGER, BACKLOG_CAP_TOTAL, BACKLOG_MIN_SCORE, BACKLOG_TTL_CORRECTION_DAYS,
    BACKLOG_TTL_DEFAULT_DAYS,
};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::TaskRecord;
use crate::engine::state::DaemonState;
use crate::engine::store::NewTask;
use log::info;

/// Trigger-type weighting: corrections are the strongest signal.
fn trigger_weight(trigger: &str) -> f64 {
    match trigger {
        "correction" => 1.0,
        "question" => 0.8,
        "follow_up" => 0.6,
        "pattern" => 0.5,
        _ => 0.4,
    }
}

/// Interest score in [0,1] computed from the factors stored in `extra`:
/// user interest, knowledge gap, trigger-type weight, recency, and prior
/// exploration count.
pub fn curiosity_score(extra: &serde_json::Value, age_days: f64) -> f64 {
    let user_interest = extra["user_interest"].as_f64().unwrap_or(0.5);
    let knowledge_gap = extra["knowledge_gap"].as_f64().unwrap_or(0.5);
    let trigger = trigger_weight(extra["trigger"].as_str().unwrap_or(""));
    let recency = (0.5f64).powf(age_days / 7.0);
    let explorations = extra["exploration_count"].as_i64().unwrap_or(0);
    let repetition_penalty = 1.0 / (1.0 + explorations as f64);

    (0.3 * user_interest + 0.3 * knowledge_gap + 0.2 * trigger + 0.2 * recency)
        * repetition_penalty
}

/// Map a score in [0,1] to the queue's priority scale (1 urgent … 9 idle).
fn score_to_priority(score: f64) -> i64 {
    (9.0 - score.clamp(0.0, 1.0) * 8.0).round() as i64
}

/// Enqueue a curiosity item with its priority derived from the stored
/// factors. Returns the task id.
pub fn enqueue_curiosity(
    state: &DaemonState,
    topic: &str,
    description: &str,
    extra: serde_json::Value,
    session_id: Option<i64>,
) -> DaemonResult<i64> {
    let score = curiosity_score(&extra, 0.0);
    state.store.enqueue_task(&NewTask {
        title: topic.to_string(),
        description: description.to_string(),
        task_type: "curiosity".into(),
        priority: score_to_priority(score),
        extra,
        session_id,
        ..Default::default()
    })
}

fn age_days(task: &TaskRecord) -> f64 {
    let created = crate::engine::store::parse_rfc3339(&task.created_at);
    (chrono::Utc::now() - created).num_seconds().max(0) as f64 / 86_400.0
}

fn ttl_days(task: &TaskRecord) -> i64 {
    match task.extra["trigger"].as_str() {
        Some("correction") => BACKLOG_TTL_CORRECTION_DAYS,
        _ => BACKLOG_TTL_DEFAULT_DAYS,
    }
}

/// Ready curiosity items, most urgent first.
pub fn backlog(state: &DaemonState) -> DaemonResult<Vec<TaskRecord>> {
    state
        .store
        .ready_tasks_of_type("curiosity", BACKLOG_CAP_TOTAL * 2)
}

/// Garbage-collect the backlog: drop items below the score floor or past
/// their TTL, then enforce the per-trigger and total caps (lowest score
/// evicted first). Returns how many were removed.
pub fn gc(state: &DaemonState) -> DaemonResult<usize> {
    let items = backlog(state)?;
    let mut removed = 0usize;
    let mut survivors: Vec<(TaskRecord, f64)> = Vec::new();

    for task in items {
        let age = age_days(&task);
        let score = curiosity_score(&task.extra, age);
        if score < BACKLOG_MIN_SCORE || age > ttl_days(&task) as f64 {
            state.store.delete_task(task.id)?;
            removed += 1;
        } else {
            survivors.push((task, score));
        }
    }

    // Keep priorities in line with decayed scores.
    for (task, score) in &survivors {
        let priority = score_to_priority(*score);
        if priority != task.priority {
            state.store.set_task_priority(task.id, priority)?;
        }
    }

    // Per-trigger cap, then total cap; evict lowest score first.
    survivors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut per_trigger: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut kept = 0usize;
    for (task, _) in &survivors {
        let trigger = task.extra["trigger"].as_str().unwrap_or("other").to_string();
        let count = per_trigger.entry(trigger).or_insert(0);
        if *count >= BACKLOG_CAP_PER_TRIGGER || kept >= BACKLOG_CAP_TOTAL {
            state.store.delete_task(task.id)?;
            removed += 1;
        } else {
            *count += 1;
            kept += 1;
        }
    }

    if removed > 0 {
        info!("[ambient] Backlog GC removed {removed} item(s), {kept} remain");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn score_prefers_corrections_and_fresh_items() {
        let correction = serde_json::json!({"trigger": "correction", "user_interest": 0.8, "knowledge_gap": 0.8});
        let stale_pattern = serde_json::json!({"trigger": "pattern", "user_interest": 0.3, "knowledge_gap": 0.3});
        assert!(curiosity_score(&correction, 0.0) > curiosity_score(&stale_pattern, 10.0));
    }

    #[test]
    fn repeated_exploration_decays_score() {
        let fresh = serde_json::json!({"trigger": "question"});
        let explored = serde_json::json!({"trigger": "question", "exploration_count": 4});
        assert!(curiosity_score(&fresh, 0.0) > 2.0 * curiosity_score(&explored, 0.0));
    }

    #[test]
    fn priority_mapping_covers_scale() {
        assert_eq!(score_to_priority(1.0), 1);
        assert_eq!(score_to_priority(0.0), 9);
        assert_eq!(score_to_priority(0.5), 5);
    }

    #[test]
    fn gc_drops_low_score_and_expired_items() {
        let state = DaemonState::for_testing();
        let keep = enqueue_curiosity(
            &state,
            "rust pinning",
            "why Pin exists",
            serde_json::json!({"trigger": "question", "user_interest": 0.9, "knowledge_gap": 0.9}),
            None,
        )
        .unwrap();
        let low = enqueue_curiosity(
            &state,
            "stale",
            "barely interesting",
            serde_json::json!({"trigger": "pattern", "user_interest": 0.0, "knowledge_gap": 0.0, "exploration_count": 9}),
            None,
        )
        .unwrap();
        let expired = enqueue_curiosity(
            &state,
            "old correction",
            "past its ttl",
            serde_json::json!({"trigger": "correction", "user_interest": 0.9, "knowledge_gap": 0.9}),
            None,
        )
        .unwrap();
        {
            let conn = state.store.conn.lock();
            let past = (chrono::Utc::now() - chrono::Duration::days(8)).to_rfc3339();
            conn.execute(
                "UPDATE project_tasks SET created_at = ?2 WHERE id = ?1",
                params![expired, past],
            )
            .unwrap();
        }

        let removed = gc(&state).unwrap();
        assert_eq!(removed, 2);
        assert!(state.store.get_task(keep).unwrap().is_some());
        assert!(state.store.get_task(low).unwrap().is_none());
        assert!(state.store.get_task(expired).unwrap().is_none());
    }

    #[test]
    fn per_trigger_cap_enforced() {
        let state = DaemonState::for_testing();
        for i in 0..(BACKLOG_CAP_PER_TRIGGER + 5) {
            enqueue_curiosity(
                &state,
                &format!("topic {i}"),
                "",
                serde_json::json!({"trigger": "pattern", "user_interest": 0.9, "knowledge_gap": 0.9}),
                None,
            )
            .unwrap();
        }
        gc(&state).unwrap();
        assert_eq!(backlog(&state).unwrap().len(), BACKLOG_CAP_PER_TRIGGER);
    }
}
