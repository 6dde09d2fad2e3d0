// ── dere atoms: Tuning Constants ───────────────────────────────────────────
// Compile-time defaults for queue, workflow, ambient, context, and swarm
// behavior. Values that users commonly override live in `engine::config`
// and fall back to these.

// ── Task queue ─────────────────────────────────────────────────────────────

/// User-facing work (embeddings for the current prompt).
pub const PRIORITY_HIGH: i64 = 1;
/// Summarization and other near-line work.
pub const PRIORITY_NORMAL: i64 = 5;
/// Background entity extraction.
pub const PRIORITY_LOW: i64 = 9;

/// Attempts before a task is marked failed.
pub const MAX_TASK_ATTEMPTS: i64 = 3;
/// Base retry delay; doubles per attempt (1s, 2s, 4s).
pub const TASK_BACKOFF_BASE_SECS: i64 = 1;
/// An `in_progress` task untouched this long is presumed orphaned.
pub const STALE_TASK_HOURS: i64 = 6;
/// Worker count bounds around the logical-core default.
pub const WORKER_MIN: usize = 2;
pub const WORKER_MAX: usize = 16;
/// Idle worker poll interval when the queue is empty.
pub const WORKER_IDLE_POLL_MS: u64 = 500;

// ── Workflow engine ────────────────────────────────────────────────────────

pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 60;
/// Per-activity start-to-close timeout.
pub const ACTIVITY_TIMEOUT_SECS: u64 = 600;
/// Delay between tasks in a batch exploration.
pub const BATCH_INTER_TASK_DELAY_SECS: u64 = 5;

// ── External call timeouts ─────────────────────────────────────────────────

pub const LLM_TIMEOUT_SECS: u64 = 120;
pub const EMBED_TIMEOUT_SECS: u64 = 120;
pub const SUMMARY_TIMEOUT_SECS: u64 = 30;
pub const RPC_TIMEOUT_SECS: u64 = 60;

// ── Context builder ────────────────────────────────────────────────────────

pub const CONTEXT_MAX_TOKENS: usize = 2_000;
pub const CONTEXT_CACHE_SECS: i64 = 30 * 60;
pub const SIMILARITY_THRESHOLD: f64 = 0.7;
pub const SIMILAR_BLOCKS_TOP_K: usize = 8;
pub const RECENT_SUMMARY_LIMIT: usize = 3;
/// A finding surfaced in a session within this window is not repeated.
pub const FINDING_SUPPRESSION_DAYS: i64 = 7;

// ── Ambient FSM ────────────────────────────────────────────────────────────

/// Composite score weights (sum to 1.0).
pub const WEIGHT_ACTIVITY: f64 = 0.25;
pub const WEIGHT_EMOTION: f64 = 0.20;
pub const WEIGHT_RESPONSIVENESS: f64 = 0.20;
pub const WEIGHT_TEMPORAL: f64 = 0.15;
pub const WEIGHT_TASK: f64 = 0.20;

pub const FIRE_THRESHOLD: f64 = 0.55;
/// A user prompt within this window counts as "active".
pub const ACTIVE_WINDOW_SECS: i64 = 60;
/// Idle time required before autonomous exploration may start.
pub const MIN_IDLE_BEFORE_EXPLORING_SECS: i64 = 30 * 60;
/// Minimum spacing between fired notifications.
pub const MIN_NOTIFICATION_INTERVAL_SECS: i64 = 30 * 60;
/// How long ENGAGED waits for an acknowledgment.
pub const ACK_WINDOW_SECS: i64 = 60;
/// Baseline cooldown after an ignored notification; doubles per
/// consecutive ignore, capped.
pub const COOLDOWN_BASE_SECS: i64 = 10 * 60;
pub const COOLDOWN_MAX_SECS: i64 = 4 * 60 * 60;
/// Escalation attempts before the FSM suppresses itself.
pub const ESCALATION_BUDGET: i64 = 3;

// ── Curiosity backlog ──────────────────────────────────────────────────────

pub const BACKLOG_CAP_TOTAL: usize = 100;
pub const BACKLOG_CAP_PER_TRIGGER: usize = 25;
pub const BACKLOG_MIN_SCORE: f64 = 0.15;
pub const BACKLOG_TTL_CORRECTION_DAYS: i64 = 7;
pub const BACKLOG_TTL_DEFAULT_DAYS: i64 = 14;

/// Daily exploration budgets.
pub const MAX_EXPLORATIONS_PER_DAY: i64 = 20;
pub const MAX_EXPLORATION_COST_MICRODOLLARS: i64 = 2_000_000; // $2/day

// ── Swarm coordinator ──────────────────────────────────────────────────────

pub const MAX_PARALLEL_AGENTS: usize = 4;
/// Agent output beyond this is middle-elided.
pub const MAX_OUTPUT_SIZE: usize = 256 * 1024;
/// Outputs at least this long get a generated short summary.
pub const SUMMARY_THRESHOLD: usize = 1_000;
/// Mailbox poll cadence during agent execution.
pub const MAILBOX_POLL_SECS: u64 = 30;
/// Scheduler tick while a swarm is running.
pub const SWARM_TICK_SECS: u64 = 2;
/// A swarm still `running` after this long at startup is orphaned.
pub const SWARM_ORPHAN_HOURS: i64 = 12;

// ── Misc ───────────────────────────────────────────────────────────────────

/// Prompts longer than this enqueue a summarization task.
pub const SUMMARIZATION_THRESHOLD_CHARS: usize = 500;
/// Sessions idle this long are garbage-collected (ended).
pub const SESSION_GC_HOURS: i64 = 24;
/// Request-id idempotency replay window.
pub const REPLAY_WINDOW_SECS: i64 = 10 * 60;
/// Graceful-shutdown drain budget.
pub const SHUTDOWN_DRAIN_SECS: u64 = 5;
