//! Error types for the checkpoint store.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or initialize the database file.
    #[error("Failed to open checkpoint at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Another process holds the checkpoint lock.
    #[error("Another gensync instance is using this checkpoint (lock: {path})")]
    Locked { path: PathBuf },

    /// Filesystem work around the database (lock file, renames, backups).
    #[error("Checkpoint file operation failed on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("Invalid {column} data for generation {id}: {source}")]
    Column {
        id: String,
        column: &'static str,
        source: serde_json::Error,
    },

    #[error("Checkpoint task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("Checkpoint connection is unusable after a previous panic")]
    Poisoned,

    /// The database schema version is newer than supported.
    #[error("Checkpoint schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    #[error("Backup {path} was not created")]
    BackupMissing { path: PathBuf },
}

impl StateError {
    /// True when SQLite reports the file itself as damaged or not a
    /// database, as opposed to a logic or permission problem.
    pub fn is_corruption(&self) -> bool {
        let source = match self {
            StateError::Open { source, .. }
            | StateError::Migration(source)
            | StateError::Query(source) => source,
            _ => return false,
        };
        matches!(
            source.sqlite_error_code(),
            Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
        )
    }
}
