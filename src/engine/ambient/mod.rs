// ── dere engine: Ambient Finite-State Machine ──────────────────────────────
// Decides when the daemon acts autonomously. One FSM per user (this
// daemon is single-tenant, so one instance); transitions are serial and
// persisted through the ambient_state row so a restart resumes in place.
//
// Legal transitions (any state may stay put):
//   IDLE       → MONITORING | EXPLORING
//   MONITORING → ENGAGED | IDLE
//   ENGAGED    → IDLE | COOLDOWN
//   COOLDOWN   → MONITORING | ESCALATING
//   ESCALATING → IDLE | SUPPRESSED
//   SUPPRESSED → IDLE
//   EXPLORING  → MONITORING | IDLE | ENGAGED

pub mod backlog;
pub mod score;

use crate::atoms::constants::{
    ACK_WINDOW_SECS, ACTIVE_WINDOW_SECS, COOLDOWN_BASE_SECS, COOLDOWN_MAX_SECS, ESCALATION_BUDGET,
    MAX_EXPLORATIONS_PER_DAY, MAX_EXPLORATION_COST_MICRODOLLARS, MIN_IDLE_BEFORE_EXPLORING_SECS,
    MIN_NOTIFICATION_INTERVAL_SECS,
};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::{AmbientPhase, AmbientState};
use crate::engine::events::EngineEvent;
use crate::engine::state::DaemonState;
use crate::engine::store::parse_rfc3339;
use crate::engine::workflow::exploration;
use chrono::Timelike;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Legal transition guard, mirroring the table above.
fn is_legal_transition(from: AmbientPhase, to: AmbientPhase) -> bool {
    use AmbientPhase::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Idle, Monitoring)
            | (Idle, Exploring)
            | (Monitoring, Engaged)
            | (Monitoring, Idle)
            | (Engaged, Idle)
            | (Engaged, Cooldown)
            | (Cooldown, Monitoring)
            | (Cooldown, Escalating)
            | (Escalating, Idle)
            | (Escalating, Suppressed)
            | (Suppressed, Idle)
            | (Exploring, Monitoring)
            | (Exploring, Idle)
            | (Exploring, Engaged)
    )
}

/// Tick interval range per state, in seconds. The loop sleeps a random
/// point within the range to avoid alignment with other periodic work.
fn interval_range(phase: AmbientPhase) -> (u64, u64) {
    match phase {
        AmbientPhase::Idle => (300, 600),
        AmbientPhase::Monitoring => (30, 60),
        AmbientPhase::Engaged => (5, 10),
        AmbientPhase::Cooldown => (60, 120),
        AmbientPhase::Escalating => (30, 60),
        AmbientPhase::Suppressed => (600, 900),
        AmbientPhase::Exploring => (30, 60),
    }
}

fn jittered_interval(phase: AmbientPhase) -> Duration {
    let (lo, hi) = interval_range(phase);
    let span = hi.saturating_sub(lo).max(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_secs(lo + nanos % span)
}

/// Exponential cooldown in consecutive ignores, capped.
fn cooldown_secs(consecutive_ignores: i64) -> i64 {
    let shifts = (consecutive_ignores - 1).clamp(0, 16) as u32;
    COOLDOWN_BASE_SECS
        .saturating_mul(1i64 << shifts)
        .min(COOLDOWN_MAX_SECS)
}

pub struct AmbientFsm {
    state: Arc<DaemonState>,
    /// Set by the ack RPC / user-prompt events; consumed by the tick.
    acked: AtomicBool,
}

impl AmbientFsm {
    pub fn new(state: Arc<DaemonState>) -> Self {
        AmbientFsm {
            state,
            acked: AtomicBool::new(false),
        }
    }

    /// Record an acknowledgment (explicit RPC or any user prompt while a
    /// notification is pending).
    pub fn acknowledge(&self) {
        self.acked.store(true, Ordering::SeqCst);
    }

    /// Run the FSM until shutdown. Also consumes bus events so prompts
    /// arriving between ticks count as acknowledgments.
    pub async fn run(self: Arc<Self>) {
        let mut events = self.state.events.subscribe();
        loop {
            let phase = self
                .state
                .store
                .ambient_state()
                .map(|s| s.phase)
                .unwrap_or(AmbientPhase::Idle);
            let sleep = jittered_interval(phase);
            tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {
                    if let Err(e) = self.tick().await {
                        warn!("[ambient] Tick failed: {e}");
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(EngineEvent::UserPrompt { .. }) => {
                            self.on_user_prompt();
                        }
                        Ok(EngineEvent::NotificationAcknowledged) => self.acknowledge(),
                        _ => {}
                    }
                }
            }
        }
        info!("[ambient] FSM stopped");
    }

    /// A user prompt nudges arousal up and acknowledges any pending
    /// notification.
    fn on_user_prompt(&self) {
        if let Ok(mut ambient) = self.state.store.ambient_state() {
            ambient.arousal = (ambient.arousal + 0.1).min(1.0);
            ambient.valence = (ambient.valence + 0.05).min(1.0);
            let _ = self.state.store.save_ambient_state(&ambient);
            if matches!(ambient.phase, AmbientPhase::Engaged | AmbientPhase::Escalating) {
                self.acknowledge();
            }
        }
    }

    fn transition(&self, ambient: &mut AmbientState, to: AmbientPhase) -> DaemonResult<()> {
        let from = ambient.phase;
        if !is_legal_transition(from, to) {
            warn!("[ambient] Rejected illegal transition {from} → {to}");
            return Ok(());
        }
        if from != to {
            info!("[ambient] {from} → {to}");
            self.state.events.emit(EngineEvent::AmbientTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        ambient.phase = to;
        ambient.last_transition = chrono::Utc::now().to_rfc3339();
        self.state.store.save_ambient_state(ambient)
    }

    fn idle_seconds(&self) -> i64 {
        match self.state.store.last_user_activity() {
            Ok(Some(ts)) => (chrono::Utc::now() - parse_rfc3339(&ts)).num_seconds(),
            _ => i64::MAX,
        }
    }

    fn budget_available(&self, ambient: &AmbientState) -> bool {
        ambient.explorations_today < MAX_EXPLORATIONS_PER_DAY
            && ambient.cost_today_microdollars < MAX_EXPLORATION_COST_MICRODOLLARS
    }

    /// One FSM step. Public so tests can drive it deterministically.
    pub async fn tick(&self) -> DaemonResult<()> {
        let mut ambient = self.state.store.ambient_state()?;

        // Emotion decays toward baseline each tick.
        ambient.arousal += (0.5 - ambient.arousal) * 0.05;
        ambient.valence += (0.5 - ambient.valence) * 0.02;

        // Backlog hygiene runs every tick regardless of state.
        if let Err(e) = backlog::gc(&self.state) {
            warn!("[ambient] Backlog GC failed: {e}");
        }

        let idle = self.idle_seconds();
        let user_active = idle < ACTIVE_WINDOW_SECS;

        match ambient.phase {
            AmbientPhase::Idle => {
                if user_active {
                    self.transition(&mut ambient, AmbientPhase::Monitoring)?;
                } else if idle >= MIN_IDLE_BEFORE_EXPLORING_SECS
                    && self.budget_available(&ambient)
                    && !backlog::backlog(&self.state)?.is_empty()
                {
                    self.transition(&mut ambient, AmbientPhase::Exploring)?;
                    self.launch_exploration();
                } else {
                    self.state.store.save_ambient_state(&ambient)?;
                }
            }
            AmbientPhase::Monitoring => {
                if !user_active {
                    self.transition(&mut ambient, AmbientPhase::Idle)?;
                    return Ok(());
                }
                let score = self.current_score(&ambient, idle)?;
                let spacing_ok = ambient
                    .last_notification_at
                    .as_deref()
                    .map(|t| {
                        (chrono::Utc::now() - parse_rfc3339(t)).num_seconds()
                            >= MIN_NOTIFICATION_INTERVAL_SECS
                    })
                    .unwrap_or(true);
                if ambient.enabled && score >= self.state.config.fire_threshold && spacing_ok {
                    self.fire_notification(&mut ambient, false)?;
                } else {
                    self.state.store.save_ambient_state(&ambient)?;
                }
            }
            AmbientPhase::Engaged => {
                if self.acked.swap(false, Ordering::SeqCst) {
                    ambient.consecutive_ignores = 0;
                    self.transition(&mut ambient, AmbientPhase::Idle)?;
                    return Ok(());
                }
                let waited = ambient
                    .last_notification_at
                    .as_deref()
                    .map(|t| (chrono::Utc::now() - parse_rfc3339(t)).num_seconds())
                    .unwrap_or(i64::MAX);
                if waited >= ACK_WINDOW_SECS {
                    ambient.consecutive_ignores += 1;
                    self.transition(&mut ambient, AmbientPhase::Cooldown)?;
                } else {
                    self.state.store.save_ambient_state(&ambient)?;
                }
            }
            AmbientPhase::Cooldown => {
                if self.state.store.has_critical_ready_task()? {
                    ambient.escalation_count += 1;
                    self.transition(&mut ambient, AmbientPhase::Escalating)?;
                    self.state.events.emit(EngineEvent::Notification {
                        title: "Critical task pending".into(),
                        body: "A critical-priority task needs attention.".into(),
                        critical: true,
                    });
                    return Ok(());
                }
                let since = (chrono::Utc::now() - parse_rfc3339(&ambient.last_transition))
                    .num_seconds();
                if since >= cooldown_secs(ambient.consecutive_ignores) {
                    self.transition(&mut ambient, AmbientPhase::Monitoring)?;
                } else {
                    self.state.store.save_ambient_state(&ambient)?;
                }
            }
            AmbientPhase::Escalating => {
                if self.acked.swap(false, Ordering::SeqCst) {
                    ambient.consecutive_ignores = 0;
                    ambient.escalation_count = 0;
                    self.transition(&mut ambient, AmbientPhase::Idle)?;
                } else if ambient.escalation_count >= ESCALATION_BUDGET {
                    ambient.enabled = false;
                    self.transition(&mut ambient, AmbientPhase::Suppressed)?;
                } else {
                    ambient.escalation_count += 1;
                    self.state.events.emit(EngineEvent::Notification {
                        title: "Still waiting".into(),
                        body: "The critical task is still unacknowledged.".into(),
                        critical: true,
                    });
                    self.state.store.save_ambient_state(&ambient)?;
                }
            }
            AmbientPhase::Suppressed => {
                // Only an explicit re-enable leaves SUPPRESSED; the FSM
                // never fires here regardless of score.
                if ambient.enabled {
                    ambient.consecutive_ignores = 0;
                    ambient.escalation_count = 0;
                    self.transition(&mut ambient, AmbientPhase::Idle)?;
                } else {
                    self.state.store.save_ambient_state(&ambient)?;
                }
            }
            AmbientPhase::Exploring => {
                if user_active {
                    self.transition(&mut ambient, AmbientPhase::Monitoring)?;
                    return Ok(());
                }
                // A high-confidence finding produced during this
                // exploration window is worth surfacing immediately.
                let worth_surfacing = self
                    .state
                    .store
                    .recent_findings(5)?
                    .into_iter()
                    .any(|f| {
                        f.confidence >= 0.85
                            && parse_rfc3339(&f.created_at)
                                >= parse_rfc3339(&ambient.last_transition)
                    });
                if ambient.enabled && worth_surfacing {
                    self.fire_notification(&mut ambient, false)?;
                    return Ok(());
                }
                if backlog::backlog(&self.state)?.is_empty() || !self.budget_available(&ambient) {
                    self.transition(&mut ambient, AmbientPhase::Idle)?;
                } else {
                    self.state.store.save_ambient_state(&ambient)?;
                    self.launch_exploration();
                }
            }
        }
        Ok(())
    }

    fn current_score(&self, ambient: &AmbientState, idle: i64) -> DaemonResult<f64> {
        let critical = self.state.store.has_critical_ready_task()? as i64;
        let ready_total: i64 = self
            .state
            .store
            .task_counts()?
            .into_iter()
            .find(|(s, _)| s == "ready")
            .map(|(_, n)| n)
            .unwrap_or(0);
        let inputs = score::ScoreInputs {
            idle_seconds: idle,
            arousal: ambient.arousal,
            consecutive_ignores: ambient.consecutive_ignores,
            hour: chrono::Local::now().hour(),
            critical_ready: critical,
            total_ready: ready_total,
        };
        Ok(score::composite_score(&inputs, &self.state.config.score_weights))
    }

    fn fire_notification(&self, ambient: &mut AmbientState, critical: bool) -> DaemonResult<()> {
        ambient.last_notification_at = Some(chrono::Utc::now().to_rfc3339());
        ambient.notifications_today += 1;
        self.transition(ambient, AmbientPhase::Engaged)?;
        self.state.events.emit(EngineEvent::Notification {
            title: "dere has something for you".into(),
            body: "Found something worth a look.".into(),
            critical,
        });
        Ok(())
    }

    /// Claim the top backlog item and run the exploration workflow in the
    /// background. The claim happens BEFORE the workflow starts, so a
    /// daemon crash in between leaves the task recoverable by the stale
    /// sweep rather than lost.
    fn launch_exploration(&self) {
        let claimed = match self.state.store.claim_task(&["curiosity".to_string()]) {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!("[ambient] Could not claim exploration task: {e}");
                return;
            }
        };
        info!("[ambient] Exploring task {} '{}'", claimed.id, claimed.title);
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = exploration::explore_claimed(&state, &claimed).await {
                warn!("[ambient] Exploration of task {} failed: {e}", claimed.id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::constants::PRIORITY_HIGH;
    use crate::atoms::types::{Conversation, ConversationBlock};
    use crate::engine::store::NewTask;

    fn fsm() -> Arc<AmbientFsm> {
        Arc::new(AmbientFsm::new(Arc::new(DaemonState::for_testing())))
    }

    fn record_user_prompt(fsm: &AmbientFsm, seconds_ago: i64) {
        let store = &fsm.state.store;
        let sid = store.create_session(None, None, "cli", None, None).unwrap();
        let ts = (chrono::Utc::now() - chrono::Duration::seconds(seconds_ago)).to_rfc3339();
        let conv = Conversation {
            id: 0,
            session_id: sid,
            message_type: "user".into(),
            prompt: "hi".into(),
            personality: None,
            medium: "cli".into(),
            timestamp: ts,
            first_token_ms: None,
            full_ms: None,
            thinking_ms: None,
            tool_uses: 0,
            tool_names: vec![],
        };
        store.add_conversation(&conv, &[] as &[ConversationBlock]).unwrap();
    }

    fn set_phase(fsm: &AmbientFsm, phase: AmbientPhase) {
        let mut ambient = fsm.state.store.ambient_state().unwrap();
        ambient.phase = phase;
        ambient.last_transition = chrono::Utc::now().to_rfc3339();
        fsm.state.store.save_ambient_state(&ambient).unwrap();
    }

    fn phase(fsm: &AmbientFsm) -> AmbientPhase {
        fsm.state.store.ambient_state().unwrap().phase
    }

    #[tokio::test]
    async fn idle_moves_to_monitoring_when_user_active() {
        let fsm = fsm();
        record_user_prompt(&fsm, 5);
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Monitoring);
    }

    #[tokio::test]
    async fn idle_stays_idle_with_empty_backlog() {
        let fsm = fsm();
        record_user_prompt(&fsm, 2 * 3600);
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Idle);
    }

    #[tokio::test]
    async fn engaged_without_ack_cools_down_and_escalates_on_critical() {
        // Scenario: a fired notification is ignored; during cooldown a
        // critical task arrives; the user then acknowledges.
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Engaged);
        {
            let mut ambient = fsm.state.store.ambient_state().unwrap();
            ambient.last_notification_at =
                Some((chrono::Utc::now() - chrono::Duration::seconds(ACK_WINDOW_SECS + 5)).to_rfc3339());
            fsm.state.store.save_ambient_state(&ambient).unwrap();
        }
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Cooldown);
        assert_eq!(fsm.state.store.ambient_state().unwrap().consecutive_ignores, 1);

        fsm.state
            .store
            .enqueue_task(&NewTask {
                title: "urgent".into(),
                task_type: "embedding".into(),
                priority: PRIORITY_HIGH,
                extra: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap();
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Escalating);

        fsm.acknowledge();
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Idle);
        let ambient = fsm.state.store.ambient_state().unwrap();
        assert_eq!(ambient.consecutive_ignores, 0);
        assert_eq!(ambient.escalation_count, 0);
    }

    #[tokio::test]
    async fn engaged_with_ack_returns_to_idle() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Engaged);
        fsm.acknowledge();
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Idle);
    }

    #[tokio::test]
    async fn escalation_budget_exhaustion_suppresses() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Escalating);
        {
            let mut ambient = fsm.state.store.ambient_state().unwrap();
            ambient.escalation_count = ESCALATION_BUDGET;
            fsm.state.store.save_ambient_state(&ambient).unwrap();
        }
        fsm.tick().await.unwrap();
        let ambient = fsm.state.store.ambient_state().unwrap();
        assert_eq!(ambient.phase, AmbientPhase::Suppressed);
        assert!(!ambient.enabled);

        // Suppressed never fires; only explicit re-enable leaves.
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Suppressed);
        {
            let mut a = fsm.state.store.ambient_state().unwrap();
            a.enabled = true;
            fsm.state.store.save_ambient_state(&a).unwrap();
        }
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Idle);
    }

    #[tokio::test]
    async fn idle_user_with_backlog_starts_exploring() {
        // User idle 35 minutes, a curiosity item waiting, budget intact:
        // the FSM enters EXPLORING and the starter claims the task before
        // any workflow step runs.
        let fsm = fsm();
        record_user_prompt(&fsm, 35 * 60);
        let task_id = crate::engine::ambient::backlog::enqueue_curiosity(
            &fsm.state,
            "how sqlite wal checkpoints work",
            "",
            serde_json::json!({"trigger": "question", "user_interest": 0.6, "knowledge_gap": 0.6}),
            None,
        )
        .unwrap();

        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Exploring);
        let task = fsm.state.store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, crate::atoms::types::TaskStatus::InProgress);
        assert_eq!(task.attempt_count, 1);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn budget_exhaustion_blocks_exploring() {
        let fsm = fsm();
        record_user_prompt(&fsm, 35 * 60);
        crate::engine::ambient::backlog::enqueue_curiosity(
            &fsm.state,
            "a topic",
            "",
            serde_json::json!({"trigger": "question", "user_interest": 0.9, "knowledge_gap": 0.9}),
            None,
        )
        .unwrap();
        {
            let mut ambient = fsm.state.store.ambient_state().unwrap();
            ambient.explorations_today = crate::atoms::constants::MAX_EXPLORATIONS_PER_DAY;
            fsm.state.store.save_ambient_state(&ambient).unwrap();
        }
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Idle);
    }

    #[tokio::test]
    async fn exploring_returns_to_monitoring_when_user_returns() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Exploring);
        record_user_prompt(&fsm, 1);
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Monitoring);
    }

    #[tokio::test]
    async fn exploring_with_empty_backlog_goes_idle() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Exploring);
        record_user_prompt(&fsm, 2 * 3600);
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Idle);
    }

    #[tokio::test]
    async fn monitoring_fires_when_score_clears_threshold() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Monitoring);
        record_user_prompt(&fsm, 1);
        {
            let mut ambient = fsm.state.store.ambient_state().unwrap();
            ambient.arousal = 1.0;
            fsm.state.store.save_ambient_state(&ambient).unwrap();
        }
        fsm.state
            .store
            .enqueue_task(&NewTask {
                title: "urgent".into(),
                task_type: "embedding".into(),
                priority: PRIORITY_HIGH,
                extra: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap();
        fsm.tick().await.unwrap();
        let ambient = fsm.state.store.ambient_state().unwrap();
        assert_eq!(ambient.phase, AmbientPhase::Engaged);
        assert!(ambient.last_notification_at.is_some());
        assert_eq!(ambient.notifications_today, 1);
    }

    #[tokio::test]
    async fn monitoring_holds_below_threshold() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Monitoring);
        record_user_prompt(&fsm, 1);
        {
            let mut ambient = fsm.state.store.ambient_state().unwrap();
            ambient.arousal = 0.0;
            ambient.consecutive_ignores = 8;
            fsm.state.store.save_ambient_state(&ambient).unwrap();
        }
        fsm.tick().await.unwrap();
        assert_eq!(phase(&fsm), AmbientPhase::Monitoring);
    }

    #[tokio::test]
    async fn notification_spacing_blocks_refire() {
        let fsm = fsm();
        set_phase(&fsm, AmbientPhase::Monitoring);
        record_user_prompt(&fsm, 1);
        {
            let mut ambient = fsm.state.store.ambient_state().unwrap();
            ambient.arousal = 1.0;
            ambient.last_notification_at = Some(chrono::Utc::now().to_rfc3339());
            fsm.state.store.save_ambient_state(&ambient).unwrap();
        }
        fsm.state
            .store
            .enqueue_task(&NewTask {
                title: "urgent".into(),
                task_type: "embedding".into(),
                priority: PRIORITY_HIGH,
                extra: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap();
        fsm.tick().await.unwrap();
        assert_eq!(
            phase(&fsm),
            AmbientPhase::Monitoring,
            "min notification interval must gate firing"
        );
    }

    #[test]
    fn cooldown_grows_exponentially_and_caps() {
        assert_eq!(cooldown_secs(1), COOLDOWN_BASE_SECS);
        assert_eq!(cooldown_secs(2), COOLDOWN_BASE_SECS * 2);
        assert_eq!(cooldown_secs(3), COOLDOWN_BASE_SECS * 4);
        assert_eq!(cooldown_secs(50), COOLDOWN_MAX_SECS);
    }

    #[test]
    fn transition_table_rejects_reverts() {
        assert!(is_legal_transition(AmbientPhase::Idle, AmbientPhase::Exploring));
        assert!(is_legal_transition(AmbientPhase::Exploring, AmbientPhase::Engaged));
        assert!(!is_legal_transition(AmbientPhase::Idle, AmbientPhase::Engaged));
        assert!(!is_legal_transition(AmbientPhase::Suppressed, AmbientPhase::Monitoring));
        assert!(!is_legal_transition(AmbientPhase::Cooldown, AmbientPhase::Engaged));
    }
}
