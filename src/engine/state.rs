// ── dere engine: Shared Daemon State ───────────────────────────────────────
// The process-wide singleton handed to every component as Arc<DaemonState>.
// All global state (store handle, clients, budget tracker, cancellation)
// lives here behind narrow accessors; there are no module-level mutable
// variables elsewhere. Tests construct one over an in-memory store.

use crate::atoms::error::DaemonResult;
use crate::engine::cancel::CancelToken;
use crate::engine::clients::{EmbeddingClient, LlmClient};
use crate::engine::config::DaemonConfig;
use crate::engine::context::ContextBuilder;
use crate::engine::events::EventBus;
use crate::engine::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Daily token/cost tracker for LLM spend. Tracks cumulative tokens for
/// the current UTC date and resets automatically on a new day. Shared
/// across all runs; fields are atomic so recording is cheap.
pub struct DailyBudgetTracker {
    /// UTC date string "YYYY-MM-DD" of the current tracking day.
    date: Mutex<String>,
    pub tokens: AtomicU64,
    /// Accumulated cost, stored as micro-dollars for atomic ops.
    pub cost_microdollars: AtomicU64,
}

impl Default for DailyBudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DailyBudgetTracker {
    pub fn new() -> Self {
        DailyBudgetTracker {
            date: Mutex::new(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            tokens: AtomicU64::new(0),
            cost_microdollars: AtomicU64::new(0),
        }
    }

    fn maybe_reset(&self) {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut d = self.date.lock();
        if *d != today {
            *d = today;
            self.tokens.store(0, Ordering::Relaxed);
            self.cost_microdollars.store(0, Ordering::Relaxed);
        }
    }

    /// Add spend from a completed call.
    pub fn record(&self, tokens: u64, cost_microdollars: u64) {
        self.maybe_reset();
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        self.cost_microdollars
            .fetch_add(cost_microdollars, Ordering::Relaxed);
    }

    /// Today's accumulated cost in micro-dollars.
    pub fn spent_microdollars(&self) -> u64 {
        self.maybe_reset();
        self.cost_microdollars.load(Ordering::Relaxed)
    }

    /// Some(spend) when today's spend meets or exceeds the budget.
    pub fn check_budget(&self, budget_microdollars: u64) -> Option<u64> {
        let spent = self.spent_microdollars();
        (spent >= budget_microdollars).then_some(spent)
    }
}

pub struct DaemonState {
    pub store: Store,
    pub config: DaemonConfig,
    pub events: EventBus,
    pub embedder: EmbeddingClient,
    pub llm: LlmClient,
    pub context: ContextBuilder,
    /// Set once at shutdown; every background loop watches it.
    pub shutdown: CancelToken,
    pub daily_budget: DailyBudgetTracker,
    /// Cancellation tokens for live workflow runs, keyed by run id.
    pub workflow_cancels: Mutex<HashMap<String, CancelToken>>,
    /// request_id → (epoch_secs, response) idempotency replay window.
    pub replay: Mutex<HashMap<String, (i64, serde_json::Value)>>,
    /// In-flight request-surface handlers, for the shutdown drain.
    pub inflight_handlers: AtomicUsize,
}

impl DaemonState {
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store = Store::open(&config.db_path)?;
        Ok(Self::with_store(config, store))
    }

    fn with_store(config: DaemonConfig, store: Store) -> Self {
        let embedder = EmbeddingClient::new(&config.ollama_base_url, &config.embedding_model);
        let llm = LlmClient::new(&config.ollama_base_url);
        DaemonState {
            store,
            config,
            events: EventBus::new(),
            embedder,
            llm,
            context: ContextBuilder::new(),
            shutdown: CancelToken::new(),
            daily_budget: DailyBudgetTracker::new(),
            workflow_cancels: Mutex::new(HashMap::new()),
            replay: Mutex::new(HashMap::new()),
            inflight_handlers: AtomicUsize::new(0),
        }
    }

    /// State over an in-memory store, for tests.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        let config = DaemonConfig::for_testing(std::path::PathBuf::from(":memory:"));
        let store = Store::open_in_memory().expect("in-memory store");
        Self::with_store(config, store)
    }
}
