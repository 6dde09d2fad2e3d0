// ── dere engine: Session-Context Builder ───────────────────────────────────
// On every user prompt, assemble a bounded-token context string from
// conversation history (embedding similarity), session summaries, related
// sessions, and exploration findings. Material is added greedily in
// priority order; token count ≈ characters / 4.
//
// A per-session cache (30 min TTL) short-circuits repeat builds, and a
// single-flight guard per (session, prompt-fingerprint) ensures concurrent
// hook retries share one embedding call.

use crate::atoms::constants::{
    CONTEXT_CACHE_SECS, CONTEXT_MAX_TOKENS, FINDING_SUPPRESSION_DAYS, RECENT_SUMMARY_LIMIT,
    SIMILARITY_THRESHOLD, SIMILAR_BLOCKS_TOP_K,
};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::{ContextMode, ContextResult, ContextSource};
use crate::engine::events::EngineEvent;
use crate::engine::personality;
use crate::engine::state::DaemonState;
use log::{debug, info, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Request to build additional context for a prompt.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub session_id: i64,
    pub prompt: String,
    pub mode: ContextMode,
    pub project_path: Option<String>,
    pub personality: Option<String>,
    pub max_tokens: usize,
}

impl ContextRequest {
    pub fn new(session_id: i64, prompt: impl Into<String>) -> Self {
        ContextRequest {
            session_id,
            prompt: prompt.into(),
            mode: ContextMode::Smart,
            project_path: None,
            personality: None,
            max_tokens: CONTEXT_MAX_TOKENS,
        }
    }
}

struct CachedContext {
    fingerprint: String,
    built_at: chrono::DateTime<chrono::Utc>,
    result: ContextResult,
}

pub struct ContextBuilder {
    cache: Mutex<HashMap<i64, CachedContext>>,
    /// Single-flight guards keyed by "session:fingerprint".
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// token count ≈ characters / 4
fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn fingerprint(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn empty_result() -> ContextResult {
    ContextResult {
        context: String::new(),
        total_tokens: 0,
        context_sources: vec![],
        sessions_referenced: vec![],
        relevance_score: 0.0,
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder {
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Build (or fetch) the context for a request. Failed sources are
    /// skipped; the result is whatever assembled from the rest, or an
    /// empty string when nothing fit.
    pub async fn build(
        &self,
        state: &DaemonState,
        request: &ContextRequest,
    ) -> DaemonResult<ContextResult> {
        if request.max_tokens == 0 {
            return Ok(empty_result());
        }

        let fp = fingerprint(&request.prompt);
        if let Some(cached) = self.cache_lookup(request.session_id) {
            if !self.cache_matches(request.session_id, &fp) {
                debug!(
                    "[context] Serving session {} cache built for an earlier prompt",
                    request.session_id
                );
            }
            return Ok(cached);
        }

        // Single-flight: concurrent builders for the same (session, prompt)
        // serialize here; followers find the leader's cache entry.
        let key = format!("{}:{}", request.session_id, fp);
        let guard = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;
        if let Some(cached) = self.cache_lookup(request.session_id) {
            return Ok(cached);
        }

        let result = self.assemble(state, request).await;

        if let Ok(ref built) = result {
            self.cache.lock().insert(
                request.session_id,
                CachedContext {
                    fingerprint: fp,
                    built_at: chrono::Utc::now(),
                    result: built.clone(),
                },
            );
            state.events.emit(EngineEvent::ContextBuilt {
                session_id: request.session_id,
                total_tokens: built.total_tokens,
            });
        }
        self.inflight.lock().remove(&key);
        result
    }

    fn cache_lookup(&self, session_id: i64) -> Option<ContextResult> {
        let cache = self.cache.lock();
        let entry = cache.get(&session_id)?;
        let age = chrono::Utc::now() - entry.built_at;
        (age.num_seconds() < CONTEXT_CACHE_SECS).then(|| entry.result.clone())
    }

    /// Non-building cache peek, used by the session-start handler to
    /// report "cached" without triggering any work.
    pub fn peek_cache(&self, session_id: i64) -> Option<ContextResult> {
        self.cache_lookup(session_id)
    }

    fn cache_matches(&self, session_id: i64, fp: &str) -> bool {
        self.cache
            .lock()
            .get(&session_id)
            .map(|e| e.fingerprint == fp)
            .unwrap_or(false)
    }

    /// Drop the cache entry for a session (called on session end).
    pub fn invalidate(&self, session_id: i64) {
        self.cache.lock().remove(&session_id);
    }

    async fn assemble(
        &self,
        state: &DaemonState,
        request: &ContextRequest,
    ) -> DaemonResult<ContextResult> {
        let budget = request.max_tokens;
        let header = personality::context_header(request.personality.as_deref());
        let mut used = estimate_tokens(header) + 1;
        let mut lines: Vec<String> = Vec::new();
        let mut sources: Vec<ContextSource> = Vec::new();
        let mut referenced: Vec<i64> = Vec::new();
        let mut surfaced: Vec<i64> = Vec::new();

        let working_dir = request.project_path.clone().or_else(|| {
            state
                .store
                .get_session(request.session_id)
                .ok()
                .flatten()
                .and_then(|s| s.working_dir)
        });

        let use_summaries = matches!(request.mode, ContextMode::Summary | ContextMode::Smart);
        let use_similar = matches!(request.mode, ContextMode::Full | ContextMode::Smart);

        // ── Recent session summaries (same working directory) ──────────
        if use_summaries {
            if let Some(ref dir) = working_dir {
                match state.store.recent_summaries_for_dir(
                    dir,
                    request.session_id,
                    RECENT_SUMMARY_LIMIT,
                ) {
                    Ok(summaries) => {
                        for s in summaries {
                            let line = format!("- [Session {}] {}", s.session_id, s.summary);
                            let tokens = estimate_tokens(&line);
                            if used + tokens > budget {
                                continue;
                            }
                            used += tokens;
                            lines.push(line);
                            referenced.push(s.session_id);
                            sources.push(ContextSource {
                                kind: "summary".into(),
                                session_id: Some(s.session_id),
                                tokens,
                                score: 0.6,
                            });
                        }
                    }
                    Err(e) => warn!("[context] Summary source failed: {e}"),
                }
            }
        }

        // ── Semantically similar conversations ─────────────────────────
        if use_similar && used < budget {
            match state.embedder.embed(&request.prompt).await {
                Ok(query) => {
                    match state.store.search_similar_blocks(
                        &query,
                        SIMILAR_BLOCKS_TOP_K,
                        SIMILARITY_THRESHOLD,
                        request.session_id,
                    ) {
                        Ok(hits) => {
                            for hit in hits {
                                let pct = (hit.similarity * 100.0).round() as i64;
                                let snippet = clip(&hit.content, 600);
                                let line = format!("- ({pct}% match) {snippet}");
                                let tokens = estimate_tokens(&line);
                                if used + tokens > budget {
                                    continue;
                                }
                                used += tokens;
                                lines.push(line);
                                referenced.push(hit.session_id);
                                sources.push(ContextSource {
                                    kind: "similar".into(),
                                    session_id: Some(hit.session_id),
                                    tokens,
                                    score: hit.similarity,
                                });
                            }
                        }
                        Err(e) => warn!("[context] Similarity source failed: {e}"),
                    }
                }
                Err(e) => warn!("[context] Embedding failed, skipping similarity source: {e}"),
            }
        }

        // ── Exploration findings (suppressed per session for 7 days) ───
        if used < budget {
            match state.store.surfaceable_findings(
                request.session_id,
                0.5,
                FINDING_SUPPRESSION_DAYS,
                3,
            ) {
                Ok(findings) => {
                    for f in findings {
                        let pct = (f.confidence * 100.0).round() as i64;
                        let line = format!("- (explored, {pct}% confidence) {}", f.finding);
                        let tokens = estimate_tokens(&line);
                        if used + tokens > budget {
                            continue;
                        }
                        used += tokens;
                        lines.push(line);
                        surfaced.push(f.id);
                        sources.push(ContextSource {
                            kind: "finding".into(),
                            session_id: None,
                            tokens,
                            score: f.confidence,
                        });
                    }
                }
                Err(e) => warn!("[context] Finding source failed: {e}"),
            }
        }

        // ── Related-session summaries ──────────────────────────────────
        if used < budget {
            match state.store.related_session_summaries(
                request.session_id,
                working_dir.as_deref(),
                request.personality.as_deref(),
                &referenced,
                2,
            ) {
                Ok(related) => {
                    for s in related {
                        let line = format!("- [Related session {}] {}", s.session_id, s.summary);
                        let tokens = estimate_tokens(&line);
                        if used + tokens > budget {
                            continue;
                        }
                        used += tokens;
                        lines.push(line);
                        referenced.push(s.session_id);
                        sources.push(ContextSource {
                            kind: "related".into(),
                            session_id: Some(s.session_id),
                            tokens,
                            score: 0.5,
                        });
                    }
                }
                Err(e) => warn!("[context] Related-session source failed: {e}"),
            }
        }

        if lines.is_empty() {
            return Ok(empty_result());
        }

        // Surfacing is recorded only once the finding actually ships.
        for finding_id in surfaced {
            if let Err(e) = state
                .store
                .record_surfaced_finding(finding_id, request.session_id)
            {
                warn!("[context] Failed to record surfaced finding {finding_id}: {e}");
            }
        }

        let context = format!("{header}\n{}", lines.join("\n"));
        let total_tokens = estimate_tokens(&context);
        let weighted: f64 = sources.iter().map(|s| s.score * s.tokens as f64).sum();
        let token_sum: f64 = sources.iter().map(|s| s.tokens as f64).sum();
        let relevance_score = if token_sum > 0.0 { weighted / token_sum } else { 0.0 };

        referenced.sort_unstable();
        referenced.dedup();

        info!(
            "[context] Built {} tokens from {} sources for session {}",
            total_tokens,
            sources.len(),
            request.session_id
        );
        Ok(ContextResult {
            context,
            total_tokens,
            context_sources: sources,
            sessions_referenced: referenced,
            relevance_score,
        })
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_is_quarter_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = fingerprint("What is a monad?");
        let b = fingerprint("What is a monad?");
        let c = fingerprint("What is a functor?");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let s = "héllo wörld";
        let clipped = clip(s, 3);
        assert!(clipped.ends_with('…'));
        assert!(clipped.len() <= 3 + '…'.len_utf8());
    }

    #[tokio::test]
    async fn zero_budget_returns_empty_without_embedding() {
        let state = DaemonState::for_testing();
        let mut request = ContextRequest::new(1, "anything");
        request.max_tokens = 0;
        // No embedding server is running in tests; this must not try to
        // reach one.
        let result = state.context.build(&state, &request).await.unwrap();
        assert!(result.context.is_empty());
        assert_eq!(result.total_tokens, 0);
        assert!(result.context_sources.is_empty());
    }

    #[tokio::test]
    async fn summary_mode_assembles_without_embedding() {
        let state = DaemonState::for_testing();
        let current = state
            .store
            .create_session(Some("/proj"), None, "cli", None, None)
            .unwrap();
        let other = state
            .store
            .create_session(Some("/proj"), None, "cli", None, None)
            .unwrap();
        state
            .store
            .upsert_session_summary(other, "refactored the task queue", &[])
            .unwrap();

        let mut request = ContextRequest::new(current, "continue the refactor");
        request.mode = ContextMode::Summary;
        request.project_path = Some("/proj".into());
        let result = state.context.build(&state, &request).await.unwrap();
        assert!(result.context.contains("refactored the task queue"));
        assert_eq!(result.sessions_referenced, vec![other]);
        assert!(result.total_tokens > 0);
        assert!(result.relevance_score > 0.0);
    }

    #[tokio::test]
    async fn cache_returns_same_result_within_ttl() {
        let state = DaemonState::for_testing();
        let current = state
            .store
            .create_session(Some("/proj"), None, "cli", None, None)
            .unwrap();
        let other = state
            .store
            .create_session(Some("/proj"), None, "cli", None, None)
            .unwrap();
        state
            .store
            .upsert_session_summary(other, "first pass", &[])
            .unwrap();

        let mut request = ContextRequest::new(current, "prompt");
        request.mode = ContextMode::Summary;
        request.project_path = Some("/proj".into());
        let first = state.context.build(&state, &request).await.unwrap();

        // Mutate the underlying data; the cache must still serve the old
        // string within the TTL.
        state
            .store
            .upsert_session_summary(other, "second pass", &[])
            .unwrap();
        let second = state.context.build(&state, &request).await.unwrap();
        assert_eq!(first.context, second.context);

        state.context.invalidate(current);
        let third = state.context.build(&state, &request).await.unwrap();
        assert!(third.context.contains("second pass"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_builds_share_one_computation() {
        let state = Arc::new(DaemonState::for_testing());
        let current = state
            .store
            .create_session(Some("/proj"), None, "cli", None, None)
            .unwrap();
        let other = state
            .store
            .create_session(Some("/proj"), None, "cli", None, None)
            .unwrap();
        state
            .store
            .upsert_session_summary(other, "shared history", &[])
            .unwrap();

        let mut request = ContextRequest::new(current, "same prompt");
        request.mode = ContextMode::Summary;
        request.project_path = Some("/proj".into());

        let a = {
            let state = state.clone();
            let request = request.clone();
            tokio::spawn(async move { state.context.build(&state, &request).await.unwrap() })
        };
        let b = {
            let state = state.clone();
            let request = request.clone();
            tokio::spawn(async move { state.context.build(&state, &request).await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.context, b.context);
        assert_eq!(a.total_tokens, b.total_tokens);
    }

    #[tokio::test]
    async fn surfaced_finding_not_repeated() {
        let state = DaemonState::for_testing();
        let session = state
            .store
            .create_session(Some("/p"), None, "cli", None, None)
            .unwrap();
        let task = state
            .store
            .enqueue_task(&crate::engine::store::NewTask {
                title: "explore".into(),
                task_type: "curiosity".into(),
                priority: 5,
                extra: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap();
        state
            .store
            .add_finding(task, "the borrow checker is a flow analysis", 0.9)
            .unwrap();

        let mut request = ContextRequest::new(session, "tell me about rust");
        request.mode = ContextMode::Summary;
        let first = state.context.build(&state, &request).await.unwrap();
        assert!(first.context.contains("borrow checker"));

        state.context.invalidate(session);
        let second = state.context.build(&state, &request).await.unwrap();
        assert!(
            !second.context.contains("borrow checker"),
            "finding surfaced once must be suppressed for 7 days"
        );
    }
}
