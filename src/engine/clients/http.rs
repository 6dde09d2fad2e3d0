// ── dere engine: Outbound Call Gate ────────────────────────────────────────
//
// Every LLM/embedding call funnels through a per-provider `ProviderGate`:
// a concurrency cap, a rolling per-minute request budget, a circuit
// breaker, and the transient-retry loop (3 attempts, 1s initial delay,
// doubling, ±25% jitter). The gate speaks the daemon's error taxonomy
// directly — an open circuit surfaces as a *retryable* provider error so
// queued work backs off and comes back after the cooldown instead of
// failing terminally.

use crate::atoms::error::{DaemonError, DaemonResult};
use log::warn;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

/// Attempts per `ProviderGate::run` call, counting the first.
pub const MAX_RETRIES: u32 = 3;

const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Consecutive failures that trip a gate's circuit, and how long it
/// stays open before allowing a probe.
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN_SECS: u64 = 60;

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Exponential backoff with ±25% jitter sourced from the clock's
/// sub-second nanos (no rand dependency). Window is [0.75·b, 1.25·b).
fn jittered_backoff_ms(attempt: u32) -> u64 {
    let base = INITIAL_RETRY_DELAY_MS
        .saturating_mul(1 << attempt.min(16))
        .min(MAX_RETRY_DELAY_MS);
    let spread = base / 2;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let jittered = base - base / 4 + if spread == 0 { 0 } else { nanos % spread };
    jittered.max(100)
}

// ── Circuit breaker ────────────────────────────────────────────────────────

/// Trips after N consecutive failures; while open, `check` refuses calls
/// with a retryable provider error carrying the gate's label. After the
/// cooldown one probe is allowed through (half-open).
struct CircuitBreaker {
    label: &'static str,
    consecutive_failures: AtomicU32,
    /// Epoch secs when the circuit tripped open.
    tripped_at: AtomicU64,
    threshold: u32,
    cooldown_secs: u64,
}

impl CircuitBreaker {
    const fn new(label: &'static str, threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            label,
            consecutive_failures: AtomicU32::new(0),
            tripped_at: AtomicU64::new(0),
            threshold,
            cooldown_secs,
        }
    }

    fn check(&self) -> DaemonResult<()> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return Ok(());
        }
        let since = epoch_secs().saturating_sub(self.tripped_at.load(Ordering::Relaxed));
        if since < self.cooldown_secs {
            return Err(DaemonError::provider(
                self.label,
                format!(
                    "circuit open after {failures} consecutive failures, {}s of cooldown left",
                    self.cooldown_secs - since
                ),
                true,
            ));
        }
        // Cooldown lapsed: allow one probe through.
        Ok(())
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped_at.store(0, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            self.tripped_at.store(epoch_secs(), Ordering::Relaxed);
            warn!(
                "[clients] {} circuit tripped after {failures} consecutive failures — cooling down {}s",
                self.label, self.cooldown_secs
            );
        }
    }
}

// ── Provider gate ──────────────────────────────────────────────────────────

struct MinuteWindow {
    window_start: SystemTime,
    count: u32,
}

/// One gate per provider. Callers await a slot; there is no
/// queue-jumping. `run` owns the whole retry discipline, so the clients
/// only describe the single attempt.
pub struct ProviderGate {
    label: &'static str,
    semaphore: Arc<Semaphore>,
    per_minute: u32,
    window: Mutex<MinuteWindow>,
    breaker: CircuitBreaker,
}

impl ProviderGate {
    pub fn new(label: &'static str, max_concurrent: usize, per_minute: u32) -> Self {
        ProviderGate {
            label,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            per_minute,
            window: Mutex::new(MinuteWindow {
                window_start: SystemTime::now(),
                count: 0,
            }),
            breaker: CircuitBreaker::new(label, BREAKER_THRESHOLD, BREAKER_COOLDOWN_SECS),
        }
    }

    /// A gate with a custom breaker, for tests that exercise tripping
    /// without sitting through the full failure budget.
    #[cfg(test)]
    fn with_breaker(label: &'static str, threshold: u32, cooldown_secs: u64) -> Self {
        let mut gate = Self::new(label, 8, 10_000);
        gate.breaker = CircuitBreaker::new(label, threshold, cooldown_secs);
        gate
    }

    /// Acquire a concurrency permit and a per-minute budget slot.
    async fn acquire_slot(&self) -> DaemonResult<tokio::sync::OwnedSemaphorePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DaemonError::Other(format!("{} gate closed", self.label)))?;
        loop {
            let wait = {
                let mut w = self.window.lock();
                let elapsed = w.window_start.elapsed().unwrap_or_default();
                if elapsed >= Duration::from_secs(60) {
                    w.window_start = SystemTime::now();
                    w.count = 0;
                }
                if w.count < self.per_minute {
                    w.count += 1;
                    None
                } else {
                    Some(Duration::from_secs(60).saturating_sub(elapsed))
                }
            };
            match wait {
                None => return Ok(permit),
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(50))).await,
            }
        }
    }

    /// Execute one outbound operation under the gate: breaker check,
    /// slot, then up to MAX_RETRIES attempts with backoff on retryable
    /// failures. Fatal errors propagate immediately.
    pub async fn run<T, Fut>(&self, op: impl Fn() -> Fut) -> DaemonResult<T>
    where
        Fut: Future<Output = DaemonResult<T>>,
    {
        self.breaker.check()?;
        let _slot = self.acquire_slot().await?;

        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Err(err) if err.retryable() && attempt + 1 < MAX_RETRIES => {
                    self.breaker.on_failure();
                    warn!(
                        "[clients] {} call failed (attempt {}/{}): {err}",
                        self.label,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(jittered_backoff_ms(attempt))).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.retryable() {
                        self.breaker.on_failure();
                    }
                    return Err(err);
                }
            }
        }
    }
}

// ── Shared reqwest client ──────────────────────────────────────────────────

/// One connection pool shared by every provider call.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(180))
        .build()
        .unwrap_or_default()
});

pub fn shared_client() -> reqwest::Client {
    SHARED_CLIENT.clone()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(529));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn backoff_stays_in_jitter_window() {
        for attempt in 0..6 {
            let base = (INITIAL_RETRY_DELAY_MS * (1 << attempt)).min(MAX_RETRY_DELAY_MS);
            let ms = jittered_backoff_ms(attempt);
            let lower = base - base / 4;
            let upper = base + base / 4;
            assert!(
                ms >= lower.max(100) && ms < upper.max(101),
                "attempt {attempt}: {ms} not in [{lower}, {upper})"
            );
        }
    }

    #[tokio::test]
    async fn run_retries_transient_then_succeeds() {
        let gate = ProviderGate::new("test", 2, 1000);
        let calls = AtomicUsize::new(0);
        let result: i32 = gate
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(DaemonError::Timeout("flaky".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_does_not_retry_fatal_errors() {
        let gate = ProviderGate::new("test", 2, 1000);
        let calls = AtomicUsize::new(0);
        let err = gate
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DaemonError::Validation("bad input".into())) }
            })
            .await
            .unwrap_err();
        assert!(!err.retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_opens_as_retryable_provider_error() {
        let gate = ProviderGate::with_breaker("test", 2, 60);
        // Two retryable failures inside one run trip the threshold.
        let _ = gate
            .run(|| async { Err::<(), _>(DaemonError::Timeout("down".into())) })
            .await;
        let err = gate.run(|| async { Ok::<_, DaemonError>(1) }).await.unwrap_err();
        assert!(err.retryable(), "open circuit must stay retryable");
        assert!(err.to_string().contains("circuit open"), "{err}");
    }

    #[tokio::test]
    async fn circuit_recovers_after_success() {
        let gate = ProviderGate::with_breaker("test", 2, 0);
        let _ = gate
            .run(|| async { Err::<(), _>(DaemonError::Timeout("down".into())) })
            .await;
        // Cooldown of 0 means the next call is a half-open probe; its
        // success closes the circuit again.
        assert_eq!(gate.run(|| async { Ok::<_, DaemonError>(5) }).await.unwrap(), 5);
        assert_eq!(gate.run(|| async { Ok::<_, DaemonError>(6) }).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn minute_budget_blocks_excess_requests() {
        let gate = ProviderGate::new("test", 4, 2);
        let a = gate.acquire_slot().await.unwrap();
        let b = gate.acquire_slot().await.unwrap();
        drop(a);
        drop(b);
        let third =
            tokio::time::timeout(Duration::from_millis(100), gate.acquire_slot()).await;
        assert!(third.is_err(), "third request in the same minute must wait");
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_parallel_requests() {
        let gate = ProviderGate::new("test", 1, 1000);
        let held = gate.acquire_slot().await.unwrap();
        let second =
            tokio::time::timeout(Duration::from_millis(50), gate.acquire_slot()).await;
        assert!(second.is_err(), "second concurrent request must wait");
        drop(held);
        assert!(gate.acquire_slot().await.is_ok());
    }
}
