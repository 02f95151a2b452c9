//! Checkpoint schema and migrations.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version: one per entry in [`MIGRATIONS`].
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// DDL for each schema version, in order. Never edit a released entry.
const MIGRATIONS: [&str; 2] = [SCHEMA_V1, SCHEMA_V2];

/// Version 1: the record table and the sync run log.
///
/// `images` and `urls` hold JSON arrays. `position` preserves the order in
/// which records were admitted.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY NOT NULL,
    position INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    images TEXT NOT NULL,
    urls TEXT NOT NULL,
    downloaded INTEGER NOT NULL DEFAULT 0,
    first_seen_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_downloaded ON records(downloaded);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    pages INTEGER DEFAULT 0,
    fetched INTEGER DEFAULT 0,
    admitted INTEGER DEFAULT 0,
    assets_downloaded INTEGER DEFAULT 0,
    assets_failed INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

/// Version 2: filenames whose last download attempt failed, as a JSON array.
const SCHEMA_V2: &str = r#"
ALTER TABLE records ADD COLUMN failed_assets TEXT NOT NULL DEFAULT '[]';
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(StateError::Migration)
}

/// Bring the database up to [`SCHEMA_VERSION`], one version at a time.
///
/// Each step runs in its own transaction together with the version bump,
/// so an interrupted migration leaves the previous version intact.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current = get_schema_version(conn)?;

    if current > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current,
            expected: SCHEMA_VERSION,
        });
    }

    for (index, ddl) in MIGRATIONS.iter().enumerate().skip(current.max(0) as usize) {
        let version = index as i32 + 1;
        let batch = format!("BEGIN;\n{ddl}\nPRAGMA user_version = {version};\nCOMMIT;");
        if let Err(e) = conn.execute_batch(&batch) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(StateError::Migration(e));
        }
        if current == 0 {
            tracing::debug!("Applied checkpoint schema version {version}");
        } else {
            tracing::info!("Migrated checkpoint to schema version {version}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(columns(&conn, "records").contains(&"failed_assets".to_string()));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_V1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO records (id, position, status, created_at, images, urls, downloaded, first_seen_at)
             VALUES ('g1', 0, 'COMPLETE', '2024-01-01T00:00:00', '[]', '[]', 1, 0)",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 2);
        let failed: String = conn
            .query_row("SELECT failed_assets FROM records WHERE id = 'g1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(failed, "[]");
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(StateError::UnsupportedSchemaVersion { found: 3, expected: 2 })
        ));
    }
}
