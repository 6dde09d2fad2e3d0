// ── dere atoms: Error Types ────────────────────────────────────────────────
// Single canonical error enum for the daemon, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by taxonomy (transient / validation /
//     permission / resource / terminal), not by call site.
//   • The `#[from]` attribute wires std/external error conversions.
//   • `retryable()` is the single source of truth the queue, the workflow
//     engine, and the request surface consult before retrying or reporting.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer). Transient.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// LLM / embedding provider failure. `retryable` reflects the HTTP
    /// status class (5xx and 429 retry; other 4xx are fatal).
    #[error("Provider error: {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
    },

    /// Malformed input at a public boundary. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Hook rejected, sandbox denied. Never retried.
    #[error("Permission error: {0}")]
    Permission(String),

    /// Budget exhausted (daily cost, token limit) or queue pressure.
    /// Surfaced as a soft failure; the caller decides.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Schema mismatch or missing required configuration. Only raised at
    /// startup; the daemon refuses to run.
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// An activity timed out (start-to-close or heartbeat). Transient.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation observed its cancellation token and returned early.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// Create a provider error with an explicit retryability flag.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Whether a retry with backoff may recover this error.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            Self::Provider { retryable, .. } => *retryable,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// HTTP status code for the request surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Serialization(_) => 400,
            Self::Permission(_) => 403,
            Self::Resource(_) => 429,
            Self::Network(_) | Self::Timeout(_) | Self::Provider { retryable: true, .. } => 503,
            _ => 500,
        }
    }
}

// ── Migration bridge: String → DaemonError ─────────────────────────────────
// Allows `?` on helper functions still returning `Result<T, String>`.

impl From<String> for DaemonError {
    fn from(s: String) -> Self {
        DaemonError::Other(s)
    }
}

impl From<&str> for DaemonError {
    fn from(s: &str) -> Self {
        DaemonError::Other(s.to_string())
    }
}

/// All daemon operations should return this type.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(DaemonError::Validation("bad".into()).http_status(), 400);
        assert_eq!(DaemonError::Permission("no".into()).http_status(), 403);
        assert_eq!(DaemonError::Resource("budget".into()).http_status(), 429);
        assert_eq!(DaemonError::Timeout("llm".into()).http_status(), 503);
        assert_eq!(DaemonError::Terminal("schema".into()).http_status(), 500);
    }

    #[test]
    fn retryability() {
        assert!(DaemonError::Timeout("t".into()).retryable());
        assert!(DaemonError::provider("ollama", "503", true).retryable());
        assert!(!DaemonError::provider("ollama", "404", false).retryable());
        assert!(!DaemonError::Validation("v".into()).retryable());
        assert!(!DaemonError::Cancelled("c".into()).retryable());
    }
}
