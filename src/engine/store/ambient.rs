// The ambient FSM's singleton row. The FSM itself lives in
// engine::ambient; this module only persists its state so a restart
// resumes where the daemon left off. Daily counters roll over lazily
// when the stored date falls behind the current UTC date.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::{AmbientPhase, AmbientState};
use rusqlite::params;
use std::str::FromStr;

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

impl Store {
    /// Load the singleton ambient state, creating the default row on first
    /// access and rolling daily counters when the date changed.
    pub fn ambient_state(&self) -> DaemonResult<AmbientState> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO ambient_state (id, last_transition, counters_date)
             VALUES (1, ?1, ?2)",
            params![now_rfc3339(), today()],
        )?;
        let mut state = conn.query_row(
            "SELECT phase, last_transition, next_wake, last_notification_at,
                    consecutive_ignores, escalation_count, valence, arousal,
                    counters_date, explorations_today, notifications_today,
                    cost_today_microdollars, enabled
             FROM ambient_state WHERE id = 1",
            [],
            |row| {
                let phase: String = row.get(0)?;
                Ok(AmbientState {
                    phase: AmbientPhase::from_str(&phase).unwrap_or(AmbientPhase::Idle),
                    last_transition: row.get(1)?,
                    next_wake: row.get(2)?,
                    last_notification_at: row.get(3)?,
                    consecutive_ignores: row.get(4)?,
                    escalation_count: row.get(5)?,
                    valence: row.get(6)?,
                    arousal: row.get(7)?,
                    counters_date: row.get(8)?,
                    explorations_today: row.get(9)?,
                    notifications_today: row.get(10)?,
                    cost_today_microdollars: row.get(11)?,
                    enabled: row.get::<_, i64>(12)? != 0,
                })
            },
        )?;

        if state.counters_date != today() {
            state.counters_date = today();
            state.explorations_today = 0;
            state.notifications_today = 0;
            state.cost_today_microdollars = 0;
            conn.execute(
                "UPDATE ambient_state
                 SET counters_date = ?1, explorations_today = 0,
                     notifications_today = 0, cost_today_microdollars = 0
                 WHERE id = 1",
                params![state.counters_date],
            )?;
        }
        Ok(state)
    }

    /// Persist the full ambient state.
    pub fn save_ambient_state(&self, state: &AmbientState) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ambient_state
             SET phase = ?1, last_transition = ?2, next_wake = ?3,
                 last_notification_at = ?4, consecutive_ignores = ?5,
                 escalation_count = ?6, valence = ?7, arousal = ?8,
                 counters_date = ?9, explorations_today = ?10,
                 notifications_today = ?11, cost_today_microdollars = ?12,
                 enabled = ?13
             WHERE id = 1",
            params![
                state.phase.as_str(),
                state.last_transition,
                state.next_wake,
                state.last_notification_at,
                state.consecutive_ignores,
                state.escalation_count,
                state.valence,
                state.arousal,
                state.counters_date,
                state.explorations_today,
                state.notifications_today,
                state.cost_today_microdollars,
                state.enabled as i64,
            ],
        )?;
        Ok(())
    }

    /// Add exploration cost to today's counter.
    pub fn add_exploration_cost(&self, microdollars: i64) -> DaemonResult<()> {
        let mut state = self.ambient_state()?;
        state.cost_today_microdollars += microdollars;
        self.save_ambient_state(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_row_created_on_first_read() {
        let store = Store::open_in_memory().unwrap();
        let state = store.ambient_state().unwrap();
        assert_eq!(state.phase, AmbientPhase::Idle);
        assert!(state.enabled);
        assert_eq!(state.explorations_today, 0);
    }

    #[test]
    fn save_and_reload() {
        let store = Store::open_in_memory().unwrap();
        let mut state = store.ambient_state().unwrap();
        state.phase = AmbientPhase::Monitoring;
        state.arousal = 0.8;
        state.explorations_today = 3;
        store.save_ambient_state(&state).unwrap();
        let back = store.ambient_state().unwrap();
        assert_eq!(back.phase, AmbientPhase::Monitoring);
        assert!((back.arousal - 0.8).abs() < 1e-9);
        assert_eq!(back.explorations_today, 3);
    }

    #[test]
    fn counters_roll_over_on_new_day() {
        let store = Store::open_in_memory().unwrap();
        let mut state = store.ambient_state().unwrap();
        state.counters_date = "1999-12-31".into();
        state.explorations_today = 9;
        state.cost_today_microdollars = 500_000;
        store.save_ambient_state(&state).unwrap();
        let rolled = store.ambient_state().unwrap();
        assert_eq!(rolled.explorations_today, 0);
        assert_eq!(rolled.cost_today_microdollars, 0);
        assert_eq!(rolled.counters_date, today());
    }
}
