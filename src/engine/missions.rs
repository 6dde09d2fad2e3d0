// ── dere engine: Mission Scheduler ─────────────────────────────────────────
// Missions are scheduled or manually-triggered recurring jobs. A 60s
// heartbeat computes due missions from their cron expression + timezone,
// records an execution row per run, and executes the mission prompt in an
// ambient session. `run_once` missions disable themselves after firing.

use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::Mission;
use crate::engine::events::EngineEvent;
use crate::engine::personality;
use crate::engine::state::DaemonState;
use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{error, info, warn};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const SCHEDULER_TICK_SECS: u64 = 60;

/// Next fire time for a cron expression in the given timezone, strictly
/// after `after`. Accepts standard 5-field expressions (a seconds field
/// of `0` is prepended) as well as the 6/7-field form.
pub fn next_fire(schedule: &str, timezone: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let expr = if schedule.split_whitespace().count() == 5 {
        format!("0 {schedule}")
    } else {
        schedule.to_string()
    };
    let parsed = Schedule::from_str(&expr).ok()?;
    let tz: chrono_tz::Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    parsed
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Validate a mission's schedule before storing it.
pub fn validate_schedule(schedule: &str, timezone: &str) -> DaemonResult<()> {
    if !timezone.is_empty() && timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(DaemonError::Validation(format!(
            "unknown timezone '{timezone}'"
        )));
    }
    next_fire(schedule, timezone, Utc::now())
        .map(|_| ())
        .ok_or_else(|| DaemonError::Validation(format!("invalid cron expression '{schedule}'")))
}

/// Run until shutdown: fire due missions every tick.
pub async fn scheduler_loop(state: Arc<DaemonState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(SCHEDULER_TICK_SECS)) => {}
        }
        if let Err(e) = tick(&state).await {
            warn!("[missions] Scheduler tick failed: {e}");
        }
    }
    info!("[missions] Scheduler stopped");
}

/// One scheduler pass; public so tests can drive it directly.
pub async fn tick(state: &Arc<DaemonState>) -> DaemonResult<()> {
    // Backfill next_execution_at for enabled missions that lack one
    // (fresh missions, or schedules edited while the daemon was down).
    for mission in state.store.list_missions()? {
        if mission.enabled && mission.next_execution_at.is_none() {
            let next = next_fire(&mission.schedule, &mission.timezone, Utc::now());
            state
                .store
                .set_mission_next_execution(mission.id, next.map(|d| d.to_rfc3339()).as_deref())?;
        }
    }

    let due = state.store.due_missions()?;
    if due.is_empty() {
        return Ok(());
    }
    info!("[missions] {} mission(s) due", due.len());

    for mission in due {
        let now = Utc::now();
        let next = if mission.run_once {
            None
        } else {
            next_fire(&mission.schedule, &mission.timezone, now).map(|d| d.to_rfc3339())
        };
        state
            .store
            .update_mission_run(mission.id, &now.to_rfc3339(), next.as_deref())?;
        if mission.run_once {
            state.store.set_mission_enabled(mission.id, false)?;
        }

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_mission(&state, &mission, "cron").await {
                error!("[missions] Mission '{}' failed: {e}", mission.name);
            }
        });
    }
    Ok(())
}

/// Manually trigger a mission, bypassing its schedule. Returns the
/// execution id promptly; the run itself continues in the background and
/// is observable through `mission_executions` or the event stream.
pub fn trigger_now(state: &Arc<DaemonState>, mission_id: i64) -> DaemonResult<i64> {
    let mission = state
        .store
        .get_mission(mission_id)?
        .ok_or_else(|| DaemonError::Validation(format!("no mission {mission_id}")))?;
    let (execution_id, session) = begin_execution(state, &mission, "manual")?;
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = continue_execution(&state, &mission, execution_id, session).await {
            error!("[missions] Manual run of '{}' failed: {e}", mission.name);
        }
    });
    Ok(execution_id)
}

fn begin_execution(
    state: &Arc<DaemonState>,
    mission: &Mission,
    trigger: &str,
) -> DaemonResult<(i64, i64)> {
    let execution_id = state.store.start_mission_execution(mission.id, trigger)?;
    state.events.emit(EngineEvent::MissionExecution {
        mission_id: mission.id,
        execution_id,
        status: "running".into(),
    });
    let session = state.store.create_session(
        mission.working_dir.as_deref(),
        mission.personality.as_deref(),
        "ambient",
        Some(mission.id),
        None,
    )?;
    info!(
        "[missions] Running '{}' (execution {execution_id}, session {session})",
        mission.name
    );
    Ok((execution_id, session))
}

/// Execute one mission run end to end; returns the execution id.
async fn run_mission(
    state: &Arc<DaemonState>,
    mission: &Mission,
    trigger: &str,
) -> DaemonResult<i64> {
    let (execution_id, session) = begin_execution(state, mission, trigger)?;
    continue_execution(state, mission, execution_id, session).await?;
    Ok(execution_id)
}

async fn continue_execution(
    state: &Arc<DaemonState>,
    mission: &Mission,
    execution_id: i64,
    session: i64,
) -> DaemonResult<()> {
    let system = mission.personality.as_deref().and_then(|tag| {
        personality::load_prompt(state.config.personalities_dir.as_ref(), tag)
    });
    let model = mission
        .model
        .clone()
        .unwrap_or_else(|| state.config.ambient_model.clone());

    let result = state
        .llm
        .generate(&model, system.as_deref(), &mission.prompt)
        .await;

    let status = match &result {
        Ok(generated) => {
            state.store.finish_mission_execution(
                execution_id,
                "completed",
                Some(&generated.text),
                generated.tool_count,
                None,
            )?;
            "completed"
        }
        Err(e) => {
            state.store.finish_mission_execution(
                execution_id,
                "failed",
                None,
                0,
                Some(&e.to_string()),
            )?;
            "failed"
        }
    };
    state.store.end_session(session)?;
    state.events.emit(EngineEvent::MissionExecution {
        mission_id: mission.id,
        execution_id,
        status: status.into(),
    });
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_accepted() {
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let next = next_fire("0 9 * * *", "UTC", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn timezone_shifts_fire_time() {
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        // 09:00 in Tokyo is 00:00 UTC
        let next = next_fire("0 9 * * *", "Asia/Tokyo", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(validate_schedule("not a cron", "UTC").is_err());
        assert!(validate_schedule("0 9 * * *", "Mars/Olympus").is_err());
        assert!(validate_schedule("0 9 * * *", "").is_ok());
        assert!(validate_schedule("*/5 * * * *", "Europe/Berlin").is_ok());
    }

    #[tokio::test]
    async fn tick_backfills_next_execution() {
        let state = Arc::new(DaemonState::for_testing());
        let id = state
            .store
            .create_mission(&Mission {
                id: 0,
                name: "digest".into(),
                schedule: "0 9 * * *".into(),
                timezone: "UTC".into(),
                prompt: "summarize".into(),
                personality: None,
                allowed_tools: vec![],
                model: None,
                working_dir: None,
                sandbox_mode: None,
                run_once: false,
                enabled: true,
                next_execution_at: None,
                last_execution_at: None,
                created_at: String::new(),
            })
            .unwrap();
        tick(&state).await.unwrap();
        let mission = state.store.get_mission(id).unwrap().unwrap();
        assert!(mission.next_execution_at.is_some());
    }
}
