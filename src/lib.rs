// dere — core orchestration daemon for a personal AI-assistant platform.
//
// The daemon owns all durable state (sessions, conversations, memory
// embeddings, tasks, swarms, missions) and coordinates all background
// work: a rate-limited task queue, durable exploration/swarm workflows,
// an ambient autonomy state machine, and the per-prompt context builder
// consumed by lifecycle hooks.

pub mod atoms;
pub mod engine;

pub use atoms::error::{DaemonError, DaemonResult};
