// ── dere engine: Configuration ─────────────────────────────────────────────
// All runtime configuration comes from the environment, read once at
// startup. `DERE_DB_PATH` is required; everything else has a default from
// `atoms::constants`. Hooks pass per-session values (session id,
// personality) per request, not through daemon config.

use crate::atoms::constants;
use crate::atoms::error::{DaemonError, DaemonResult};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the primary database (DERE_DB_PATH, required).
    pub db_path: PathBuf,
    /// Default embedding model name (DERE_OLLAMA_MODEL).
    pub embedding_model: String,
    /// Base URL for the local model server.
    pub ollama_base_url: String,
    /// Model used by the exploration workflow (DERE_AMBIENT_MODEL).
    pub ambient_model: String,
    /// Override summary model (DERE_SUMMARY_MODEL); falls back to ambient.
    pub summary_model: String,
    /// If set, suppresses summary generation globally (DERE_DISABLE_SUMMARY=1).
    pub disable_summary: bool,
    /// Char count above which prompts trigger summarization
    /// (DERE_SUMMARIZATION_THRESHOLD, default 500).
    pub summarization_threshold: usize,
    /// Personality asset lookup root override (DERE_EMBEDDED_PERSONALITIES_DIR).
    pub personalities_dir: Option<PathBuf>,
    /// Whether exploration runs may use write tools (DERE_EXPLORATION_WRITE=1).
    pub exploration_write: bool,
    /// HTTP listen port on localhost.
    pub http_port: u16,
    /// Worker pool size; defaults to logical cores clamped to [2,16].
    pub worker_count: usize,
    /// Ambient FSM fire threshold.
    pub fire_threshold: f64,
    /// Composite score weights: activity, emotion, responsiveness,
    /// temporal, task.
    pub score_weights: [f64; 5],
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl DaemonConfig {
    /// Load configuration from the environment. Fails Terminal when the
    /// required database path is absent.
    pub fn from_env() -> DaemonResult<Self> {
        let db_path = env("DERE_DB_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| DaemonError::Terminal("DERE_DB_PATH is not set".into()))?;

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(constants::WORKER_MIN, constants::WORKER_MAX);

        let ambient_model = env("DERE_AMBIENT_MODEL").unwrap_or_else(|| "qwen2.5:7b".into());

        Ok(DaemonConfig {
            db_path,
            embedding_model: env("DERE_OLLAMA_MODEL").unwrap_or_else(|| "nomic-embed-text".into()),
            ollama_base_url: env("DERE_OLLAMA_URL")
                .unwrap_or_else(|| "http://localhost:11434".into()),
            summary_model: env("DERE_SUMMARY_MODEL").unwrap_or_else(|| ambient_model.clone()),
            ambient_model,
            disable_summary: env("DERE_DISABLE_SUMMARY").as_deref() == Some("1"),
            summarization_threshold: env("DERE_SUMMARIZATION_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(constants::SUMMARIZATION_THRESHOLD_CHARS),
            personalities_dir: env("DERE_EMBEDDED_PERSONALITIES_DIR").map(PathBuf::from),
            exploration_write: env("DERE_EXPLORATION_WRITE").as_deref() == Some("1"),
            http_port: env("DERE_HTTP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3344),
            worker_count: env("DERE_WORKERS")
                .and_then(|v| v.parse().ok())
                .map(|n: usize| n.clamp(constants::WORKER_MIN, constants::WORKER_MAX))
                .unwrap_or(default_workers),
            fire_threshold: env("DERE_FIRE_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(constants::FIRE_THRESHOLD),
            score_weights: [
                constants::WEIGHT_ACTIVITY,
                constants::WEIGHT_EMOTION,
                constants::WEIGHT_RESPONSIVENESS,
                constants::WEIGHT_TEMPORAL,
                constants::WEIGHT_TASK,
            ],
        })
    }

    /// A config suitable for tests: in-memory-ish paths, deterministic knobs.
    #[cfg(test)]
    pub fn for_testing(db_path: PathBuf) -> Self {
        DaemonConfig {
            db_path,
            embedding_model: "nomic-embed-text".into(),
            ollama_base_url: "http://localhost:11434".into(),
            ambient_model: "test-model".into(),
            summary_model: "test-model".into(),
            disable_summary: true,
            summarization_threshold: constants::SUMMARIZATION_THRESHOLD_CHARS,
            personalities_dir: None,
            exploration_write: false,
            http_port: 0,
            worker_count: 2,
            fire_threshold: constants::FIRE_THRESHOLD,
            score_weights: [
                constants::WEIGHT_ACTIVITY,
                constants::WEIGHT_EMOTION,
                constants::WEIGHT_RESPONSIVENESS,
                constants::WEIGHT_TEMPORAL,
                constants::WEIGHT_TASK,
            ],
        }
    }
}
