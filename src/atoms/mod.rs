// ── dere atoms ─────────────────────────────────────────────────────────────
// Leaf-level building blocks shared by every engine component: the error
// taxonomy, entity/wire types, and tuning constants. Nothing in here may
// depend on `crate::engine`.

pub mod constants;
pub mod error;
pub mod types;
