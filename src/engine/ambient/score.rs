// Composite engagement score: a weighted sum in [0,1] of five signals.
// The FSM fires a notification when the score crosses the configured
// threshold (and the notification spacing allows it). Pure functions so
// the arithmetic is testable without a daemon.

/// Inputs snapshotted by the FSM tick.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    /// Seconds since the last user prompt (i64::MAX when never).
    pub idle_seconds: i64,
    /// Emotion arousal in [0,1].
    pub arousal: f64,
    /// Consecutive ignored notifications.
    pub consecutive_ignores: i64,
    /// Local hour of day (0-23).
    pub hour: u32,
    /// Ready tasks at high priority.
    pub critical_ready: i64,
    /// Total ready tasks.
    pub total_ready: i64,
}

/// Recent-activity signal: 1.0 while the user is active, decaying with
/// idle time (half-life ~15 minutes).
fn activity_signal(idle_seconds: i64) -> f64 {
    if idle_seconds <= 60 {
        return 1.0;
    }
    let idle_mins = idle_seconds as f64 / 60.0;
    (0.5f64).powf(idle_mins / 15.0)
}

/// Responsiveness history: each consecutive ignore halves the signal.
fn responsiveness_signal(consecutive_ignores: i64) -> f64 {
    1.0 / (1u64 << consecutive_ignores.clamp(0, 8)) as f64
}

/// Time-of-day appropriateness profile.
fn temporal_signal(hour: u32) -> f64 {
    match hour {
        9..=11 => 0.9,
        12..=17 => 1.0,
        18..=21 => 0.8,
        22 | 8 => 0.5,
        _ => 0.1,
    }
}

/// Pending-task urgency: critical tasks dominate, volume adds a little.
fn task_signal(critical_ready: i64, total_ready: i64) -> f64 {
    if critical_ready > 0 {
        return 1.0;
    }
    (total_ready as f64 / 10.0).min(0.6)
}

/// Weighted sum of the five signals, clamped to [0,1]. Weight order:
/// activity, emotion, responsiveness, temporal, task.
pub fn composite_score(inputs: &ScoreInputs, weights: &[f64; 5]) -> f64 {
    let signals = [
        activity_signal(inputs.idle_seconds),
        inputs.arousal.clamp(0.0, 1.0),
        responsiveness_signal(inputs.consecutive_ignores),
        temporal_signal(inputs.hour),
        task_signal(inputs.critical_ready, inputs.total_ready),
    ];
    signals
        .iter()
        .zip(weights.iter())
        .map(|(s, w)| s * w)
        .sum::<f64>()
        .clamp(0.0, 1.0)
}
