// ── dere engine ────────────────────────────────────────────────────────────
// The daemon core. Leaves-first: store and clients at the bottom, then
// the queue/workflow machinery, then the ambient FSM, context builder,
// swarm coordinator, and mission scheduler, with the request surface on
// top.

pub mod activities;
pub mod ambient;
pub mod cancel;
pub mod clients;
pub mod config;
pub mod context;
pub mod events;
pub mod missions;
pub mod paths;
pub mod personality;
pub mod queue;
pub mod server;
pub mod state;
pub mod store;
pub mod swarm;
pub mod workflow;
