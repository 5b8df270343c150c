//! Job graph orchestration for a multi-stage, multi-model document pipeline.
//!
//! Jobs live in a SQLite store ([`db`]). Terminal transitions feed an
//! outbox-driven reconciler that unlocks or fails dependents and advances
//! the owning session through its stages ([`orchestrator`]).

pub mod config;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod recipe;
pub mod session;

pub use errors::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
