// ── dere engine: External Clients ──────────────────────────────────────────
// All outbound LLM/embedding traffic goes through this layer: a shared
// reqwest client and one ProviderGate per provider owning the concurrency
// cap, the per-minute request budget, the circuit breaker, and the
// transient-retry loop.

pub mod embedding;
pub mod http;
pub mod llm;

pub use embedding::EmbeddingClient;
pub use llm::LlmClient;
