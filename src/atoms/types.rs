// ── dere atoms: Shared Types ───────────────────────────────────────────────
// Entity and wire types shared across the engine. Everything serializes
// with serde; timestamps are RFC 3339 UTC strings; statuses are typed
// enums stored as TEXT. Readers of `extra`-style JSON blobs must tolerate
// unknown keys, so no struct here uses `deny_unknown_fields`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Sessions & conversations ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub working_dir: Option<String>,
    pub personality: Option<String>,
    /// "cli" | "ui" | "ambient" | "swarm"
    pub medium: String,
    pub created_at: String,
    pub last_activity: String,
    pub ended_at: Option<String>,
    pub mission_id: Option<i64>,
    pub swarm_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: i64,
    /// "user" | "assistant" | "system"
    pub message_type: String,
    pub prompt: String,
    pub personality: Option<String>,
    pub medium: String,
    pub timestamp: String,
    pub first_token_ms: Option<i64>,
    pub full_ms: Option<i64>,
    pub thinking_ms: Option<i64>,
    pub tool_uses: i64,
    pub tool_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
        }
    }
}

impl FromStr for BlockType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "text" => Ok(Self::Text),
            "thinking" => Ok(Self::Thinking),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            other => Err(format!("unknown block type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationBlock {
    pub id: i64,
    pub conversation_id: i64,
    /// Dense, starting at 0 within the conversation.
    pub ordinal: i64,
    pub block_type: BlockType,
    pub content: String,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub is_error: bool,
    /// Attached to text blocks for recall. Absent until the embedding
    /// worker has processed the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub session_id: i64,
    pub summary: String,
    pub source_conversation_ids: Vec<i64>,
    pub created_at: String,
}

// ── Tasks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of persistent background work (the `project_tasks` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    /// "curiosity" | "embedding" | "summarization" | "entity_extraction" | …
    pub task_type: String,
    pub status: TaskStatus,
    /// Smaller = more urgent (1 high, 5 normal, 9 low).
    pub priority: i64,
    pub attempt_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// Earliest wall-clock time the task may be claimed (retry backoff).
    pub run_after: Option<String>,
    /// Loosely-typed payload; readers tolerate unknown keys.
    pub extra: serde_json::Value,
    pub outcome: Option<String>,
    pub last_error: Option<String>,
    pub blocked_by: Vec<i64>,
    pub discovered_from_task_id: Option<i64>,
    pub session_id: Option<i64>,
    pub model: Option<String>,
}

// ── Exploration findings ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationFinding {
    pub id: i64,
    pub task_id: i64,
    pub finding: String,
    pub confidence: f64,
    /// Whether the finding was promoted into the knowledge graph.
    pub promoted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntity {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub summary: String,
    pub source_finding_id: Option<i64>,
    pub mention_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ── Ambient state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientPhase {
    Idle,
    Monitoring,
    Engaged,
    Cooldown,
    Escalating,
    Suppressed,
    Exploring,
}

impl AmbientPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Monitoring => "monitoring",
            Self::Engaged => "engaged",
            Self::Cooldown => "cooldown",
            Self::Escalating => "escalating",
            Self::Suppressed => "suppressed",
            Self::Exploring => "exploring",
        }
    }
}

impl FromStr for AmbientPhase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "idle" => Ok(Self::Idle),
            "monitoring" => Ok(Self::Monitoring),
            "engaged" => Ok(Self::Engaged),
            "cooldown" => Ok(Self::Cooldown),
            "escalating" => Ok(Self::Escalating),
            "suppressed" => Ok(Self::Suppressed),
            "exploring" => Ok(Self::Exploring),
            other => Err(format!("unknown ambient phase: {other}")),
        }
    }
}

impl fmt::Display for AmbientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user singleton row driving the ambient FSM. Rolling daily counters
/// reset when `counters_date` falls behind the current UTC date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientState {
    pub phase: AmbientPhase,
    pub last_transition: String,
    pub next_wake: Option<String>,
    pub last_notification_at: Option<String>,
    pub consecutive_ignores: i64,
    pub escalation_count: i64,
    /// Emotion dimensions in [0,1], baseline 0.5.
    pub valence: f64,
    pub arousal: f64,
    pub counters_date: String,
    pub explorations_today: i64,
    pub notifications_today: i64,
    pub cost_today_microdollars: i64,
    /// Cleared when the user opts out; SUPPRESSED until re-enabled.
    pub enabled: bool,
}

// ── Swarms ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SwarmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SwarmStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown swarm status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
    TimedOut,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Agent statuses only move forward: pending → running → terminal.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Skipped | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl FromStr for AgentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    #[default]
    OnSuccess,
    OnAny,
    OnFailure,
}

impl DependencyCondition {
    /// Evaluate the gate against the upstream agent's terminal status.
    pub fn satisfied_by(self, upstream: AgentStatus) -> bool {
        match self {
            Self::OnSuccess => upstream == AgentStatus::Completed,
            Self::OnAny => upstream.is_terminal(),
            Self::OnFailure => matches!(upstream, AgentStatus::Failed | AgentStatus::TimedOut),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDependency {
    /// Name of the upstream agent within the same swarm.
    pub agent: String,
    /// Whether the upstream's output is included in this agent's prompt.
    #[serde(default)]
    pub include: bool,
    #[serde(default)]
    pub condition: DependencyCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub base_branch: String,
    pub branch_prefix: Option<String>,
    pub status: SwarmStatus,
    pub auto_synthesize: bool,
    pub skip_synthesis_on_failure: bool,
    pub synthesis_prompt: Option<String>,
    pub supervisor_warn_seconds: Option<i64>,
    pub supervisor_cancel_seconds: Option<i64>,
    pub synthesis_output: Option<String>,
    pub synthesis_summary: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmAgent {
    pub id: String,
    pub swarm_id: String,
    pub name: String,
    pub role: String,
    pub is_synthesis_agent: bool,
    pub mode: Option<String>,
    pub prompt: String,
    pub goal: Option<String>,
    pub capabilities: Vec<String>,
    pub task_types: Vec<String>,
    pub max_tasks: Option<i64>,
    pub max_duration_seconds: Option<i64>,
    pub idle_timeout_seconds: Option<i64>,
    pub allowed_tools: Vec<String>,
    pub thinking_budget: Option<i64>,
    pub model: Option<String>,
    pub sandbox_mode: Option<String>,
    pub depends_on: Vec<AgentDependency>,
    pub status: AgentStatus,
    pub output: Option<String>,
    pub output_summary: Option<String>,
    pub error: Option<String>,
    pub tool_count: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub session_id: Option<i64>,
    /// Branch created for this agent, when the swarm's prefix is set.
    pub git_branch: Option<String>,
}

/// Swarm-scoped key/value entry; keys are hierarchical paths
/// (`messages/to-<name>/<uuid>`, `notes/<topic>`, `artifacts/<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadEntry {
    pub swarm_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Payload stored under a mailbox key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub from: String,
    pub text: String,
    /// "normal" | "urgent"
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "normal".into()
}

// ── Missions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: i64,
    pub name: String,
    /// Standard cron expression ("0 9 * * MON-FRI").
    pub schedule: String,
    /// IANA timezone name; empty means UTC.
    pub timezone: String,
    pub prompt: String,
    pub personality: Option<String>,
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    pub working_dir: Option<String>,
    pub sandbox_mode: Option<String>,
    pub run_once: bool,
    pub enabled: bool,
    pub next_execution_at: Option<String>,
    pub last_execution_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionExecution {
    pub id: i64,
    pub mission_id: i64,
    /// "running" | "completed" | "failed"
    pub status: String,
    /// "cron" | "manual"
    pub trigger: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub output: Option<String>,
    pub tool_count: i64,
    pub error: Option<String>,
}

// ── Workflow runs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    /// "exploration" | "batch_exploration" | "swarm"
    pub kind: String,
    pub input: serde_json::Value,
    /// Step results keyed by step name; presence means the step completed
    /// and re-execution must skip it.
    pub step_results: serde_json::Map<String, serde_json::Value>,
    pub current_step: Option<String>,
    /// "running" | "completed" | "failed" | "cancelled"
    pub status: String,
    pub heartbeat_at: String,
    pub created_at: String,
    pub updated_at: String,
}

// ── Context builder ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Summary,
    Full,
    #[default]
    Smart,
}

impl FromStr for ContextMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "summary" => Ok(Self::Summary),
            "full" => Ok(Self::Full),
            "smart" | "" => Ok(Self::Smart),
            other => Err(format!("unknown context mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    /// "cache" | "summary" | "similar" | "finding" | "related"
    pub kind: String,
    pub session_id: Option<i64>,
    pub tokens: usize,
    pub score: f64,
}

/// Result envelope returned by the context builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextResult {
    pub context: String,
    pub total_tokens: usize,
    pub context_sources: Vec<ContextSource>,
    pub sessions_referenced: Vec<i64>,
    /// Token-weighted mean of source scores.
    pub relevance_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_never_reverts() {
        assert!(AgentStatus::Pending.can_transition_to(AgentStatus::Running));
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::Completed));
        assert!(AgentStatus::Running.can_transition_to(AgentStatus::TimedOut));
        assert!(!AgentStatus::Completed.can_transition_to(AgentStatus::Running));
        assert!(!AgentStatus::Failed.can_transition_to(AgentStatus::Pending));
    }

    #[test]
    fn dependency_conditions() {
        assert!(DependencyCondition::OnSuccess.satisfied_by(AgentStatus::Completed));
        assert!(!DependencyCondition::OnSuccess.satisfied_by(AgentStatus::Failed));
        assert!(DependencyCondition::OnAny.satisfied_by(AgentStatus::Failed));
        assert!(!DependencyCondition::OnAny.satisfied_by(AgentStatus::Running));
        assert!(DependencyCondition::OnFailure.satisfied_by(AgentStatus::TimedOut));
        assert!(!DependencyCondition::OnFailure.satisfied_by(AgentStatus::Completed));
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = TaskRecord {
            id: 7,
            title: "Embed prompt".into(),
            description: "What is a monad?".into(),
            task_type: "embedding".into(),
            status: TaskStatus::Ready,
            priority: 1,
            attempt_count: 0,
            created_at: "2025-01-01T00:00:00Z".into(),
            updated_at: "2025-01-01T00:00:00Z".into(),
            started_at: None,
            completed_at: None,
            run_after: None,
            extra: serde_json::json!({"trigger": "hook"}),
            outcome: None,
            last_error: None,
            blocked_by: vec![],
            discovered_from_task_id: None,
            session_id: Some(42),
            model: Some("nomic-embed-text".into()),
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.status, TaskStatus::Ready);
        assert_eq!(back.extra["trigger"], "hook");
    }

    #[test]
    fn unknown_extra_keys_tolerated() {
        let json = r#"{"from": "impl-a", "text": "heads up", "priority": "urgent", "ttl": 30}"#;
        let msg: MailboxMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.priority, "urgent");
    }
}
