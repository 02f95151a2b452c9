//! Checkpoint persistence.
//!
//! The record set lives in a per-account SQLite database that is rewritten
//! in one transaction after every page merge and every download batch, so an
//! interrupted run resumes from the last completed step.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::CheckpointStore;
pub use error::StateError;
pub use types::SyncRunStats;
