//! SQLite implementation of the checkpoint.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local, TimeZone, Utc};
use fs4::fs_std::FileExt;
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{CheckpointSummary, SyncRunStats};
use crate::records::{GenerationStatus, Record, RecordSet};

/// The persisted record set for one account.
///
/// Holds an exclusive lock file next to the database for its whole lifetime
/// so two processes never write the same checkpoint.
pub struct CheckpointStore {
    /// rusqlite::Connection is not Sync; every statement goes through here.
    conn: Mutex<Connection>,
    path: PathBuf,
    _lock: Option<File>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Open the checkpoint at `path`, creating it and its parent directory
    /// if needed.
    ///
    /// With `rebuild`, an existing checkpoint is first moved to
    /// `{path}.bak`. A file SQLite reports as damaged is moved to
    /// `{path}.corrupt-{timestamp}` and replaced by an empty checkpoint.
    pub async fn open(path: &Path, rebuild: bool) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(path, rebuild)).await?
    }

    fn open_blocking(path: PathBuf, rebuild: bool) -> Result<Self, StateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock = acquire_lock(&path)?;

        if rebuild {
            if let Some(backup) = Self::backup_for_rebuild(&path)? {
                tracing::info!("Previous checkpoint backed up to {}", backup.display());
            }
        }

        let conn = match open_connection(&path) {
            Ok(conn) => conn,
            Err(e) if e.is_corruption() => {
                let aside = with_suffix(
                    &path,
                    &format!(".corrupt-{}", Local::now().format("%Y%m%d_%H%M%S")),
                );
                rename_with_sidecars(&path, &aside).map_err(|source| StateError::Io {
                    path: path.clone(),
                    source,
                })?;
                tracing::warn!(
                    "Checkpoint {} is unreadable ({e}); moved it to {} and starting from an empty record set",
                    path.display(),
                    aside.display()
                );
                open_connection(&path)?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            _lock: Some(lock),
        })
    }

    /// Open an in-memory checkpoint (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|source| StateError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            _lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the checkpoint (and its WAL side files) to `{path}.bak`.
    ///
    /// Returns `None` when there is nothing to back up. Fails if the backup
    /// is not in place afterwards, so a rebuild never discards the only copy.
    pub fn backup_for_rebuild(path: &Path) -> Result<Option<PathBuf>, StateError> {
        if !path.exists() {
            return Ok(None);
        }
        let backup = with_suffix(path, ".bak");
        rename_with_sidecars(path, &backup).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !backup.exists() {
            return Err(StateError::BackupMissing { path: backup });
        }
        Ok(Some(backup))
    }

    /// Read every stored record, in admission order.
    pub fn load(&self) -> Result<RecordSet, StateError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, status, created_at, images, urls, downloaded, first_seen_at, failed_assets
             FROM records ORDER BY position",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredRecord {
                    id: row.get(0)?,
                    status: row.get(1)?,
                    created_at: row.get(2)?,
                    images: row.get(3)?,
                    urls: row.get(4)?,
                    downloaded: row.get(5)?,
                    first_seen_at: row.get(6)?,
                    failed_assets: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let records = rows
            .into_iter()
            .map(StoredRecord::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(count = records.len(), "Loaded checkpoint");
        Ok(RecordSet::from_records(records))
    }

    /// Replace the stored record set with `records` in one transaction.
    pub fn save(&self, records: &RecordSet) -> Result<(), StateError> {
        let conn = self.conn()?;
        in_transaction(&conn, |conn| {
            conn.execute("DELETE FROM records", [])?;
            let mut stmt = conn.prepare_cached(
                "INSERT INTO records (id, position, status, created_at, images, urls, downloaded, first_seen_at, failed_assets)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, record) in records.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    record.id,
                    position as i64,
                    record.status.as_str(),
                    record.created_at,
                    encode(&record.id, "images", &record.images)?,
                    encode(&record.id, "urls", &record.urls)?,
                    record.downloaded,
                    record.first_seen_at.timestamp(),
                    encode(&record.id, "failed_assets", &record.failed_assets)?,
                ])?;
            }
            Ok(())
        })?;
        tracing::debug!(count = records.len(), "Saved checkpoint");
        Ok(())
    }

    /// Write an immutable copy named `{stem}_{YYYYmmdd_HHMMSS}.db` next to
    /// the checkpoint and return its path.
    pub fn snapshot(&self, now: DateTime<Local>) -> Result<PathBuf, StateError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();

        let mut target = dir.join(format!("{stem}_{stamp}.db"));
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("{stem}_{stamp}_{n}.db"));
            n += 1;
        }

        let conn = self.conn()?;
        conn.execute(
            "VACUUM INTO ?1",
            [target.to_string_lossy().into_owned()],
        )?;
        tracing::debug!("Checkpoint snapshot written to {}", target.display());
        Ok(target)
    }

    pub fn start_sync_run(&self) -> Result<i64, StateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [Utc::now().timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, pages = ?2, fetched = ?3, admitted = ?4,
                 assets_downloaded = ?5, assets_failed = ?6, interrupted = ?7
             WHERE id = ?8",
            rusqlite::params![
                Utc::now().timestamp(),
                stats.pages as i64,
                stats.fetched as i64,
                stats.admitted as i64,
                stats.assets_downloaded as i64,
                stats.assets_failed as i64,
                stats.interrupted,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn summary(&self) -> Result<CheckpointSummary, StateError> {
        let conn = self.conn()?;

        let (total, downloaded, with_failures, failed_assets, total_assets): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(downloaded), 0),
                    COALESCE(SUM(json_array_length(failed_assets) > 0), 0),
                    COALESCE(SUM(json_array_length(failed_assets)), 0),
                    COALESCE(SUM(json_array_length(urls)), 0)
             FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let last_sync: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (last_sync_started, last_sync_completed) = match last_sync {
            Some((started, completed)) => (
                Utc.timestamp_opt(started, 0).single(),
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            ),
            None => (None, None),
        };

        Ok(CheckpointSummary {
            total_records: total as u64,
            downloaded_records: downloaded as u64,
            pending_records: (total - downloaded) as u64,
            records_with_failures: with_failures as u64,
            failed_assets: failed_assets as u64,
            total_assets: total_assets as u64,
            last_sync_started,
            last_sync_completed,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }
}

/// Row shape of the `records` table before JSON decoding.
struct StoredRecord {
    id: String,
    status: String,
    created_at: String,
    images: String,
    urls: String,
    downloaded: bool,
    first_seen_at: i64,
    failed_assets: String,
}

impl StoredRecord {
    fn into_record(self) -> Result<Record, StateError> {
        let images = decode(&self.id, "images", &self.images)?;
        let urls = decode(&self.id, "urls", &self.urls)?;
        let failed_assets = decode(&self.id, "failed_assets", &self.failed_assets)?;
        Ok(Record {
            status: GenerationStatus::from(self.status),
            created_at: self.created_at,
            images,
            urls,
            failed_assets,
            downloaded: self.downloaded,
            first_seen_at: Utc
                .timestamp_opt(self.first_seen_at, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            id: self.id,
        })
    }
}

fn encode<T: serde::Serialize>(id: &str, column: &'static str, value: &T) -> Result<String, StateError> {
    serde_json::to_string(value).map_err(|source| StateError::Column {
        id: id.to_string(),
        column,
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    id: &str,
    column: &'static str,
    raw: &str,
) -> Result<T, StateError> {
    serde_json::from_str(raw).map_err(|source| StateError::Column {
        id: id.to_string(),
        column,
        source,
    })
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on any error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = f(conn).and_then(|value| {
        conn.execute_batch("COMMIT")?;
        Ok(value)
    });
    if result.is_err() {
        let _ = conn.execute_batch("ROLLBACK");
    }
    result
}

fn open_connection(path: &Path) -> Result<Connection, StateError> {
    let open_err = |source| StateError::Open {
        path: path.to_path_buf(),
        source,
    };
    let conn = Connection::open(path).map_err(open_err)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(open_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(open_err)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

fn acquire_lock(path: &Path) -> Result<File, StateError> {
    let lock_path = with_suffix(path, ".lock");
    let file = File::create(&lock_path).map_err(|source| StateError::Io {
        path: lock_path.clone(),
        source,
    })?;
    file.try_lock_exclusive()
        .map_err(|_| StateError::Locked { path: lock_path })?;
    Ok(file)
}

/// `path` with `suffix` appended to the full file name.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Rename a database file together with its `-wal`/`-shm` files. Stale side
/// files at the destination are removed so SQLite never pairs them with the
/// renamed database.
fn rename_with_sidecars(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::rename(from, to)?;
    for side in ["-wal", "-shm"] {
        let src = with_suffix(from, side);
        let dst = with_suffix(to, side);
        if src.exists() {
            std::fs::rename(&src, &dst)?;
        } else if dst.exists() {
            std::fs::remove_file(&dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::GeneratedImage;
    use tempfile::TempDir;

    fn record(id: &str, status: GenerationStatus) -> Record {
        Record::new_fetched(
            id.to_string(),
            status,
            "2024-05-01T12:00:00".to_string(),
            vec![GeneratedImage {
                id: format!("{id}-img"),
                url: format!("https://cdn.example.com/{id}.png"),
                variations: Vec::new(),
            }],
        )
    }

    fn sample_set() -> RecordSet {
        let mut set = RecordSet::new();
        set.merge_page(vec![
            record("b", GenerationStatus::Complete),
            record("a", GenerationStatus::Other("CANCELLED".into())),
            record("c", GenerationStatus::Pending),
        ]);
        let b = set.get_mut("b").unwrap();
        b.downloaded = true;
        b.failed_assets.push("broken.png".to_string());
        set
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let set = sample_set();
        store.save(&set).unwrap();

        let loaded = store.load().unwrap();
        let ids: Vec<&str> = loaded.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        for original in set.iter() {
            let restored = loaded.get(&original.id).unwrap();
            assert_eq!(restored.status, original.status);
            assert_eq!(restored.images, original.images);
            assert_eq!(restored.urls, original.urls);
            assert_eq!(restored.downloaded, original.downloaded);
            assert_eq!(restored.failed_assets, original.failed_assets);
            assert_eq!(
                restored.first_seen_at.timestamp(),
                original.first_seen_at.timestamp()
            );
        }
    }

    #[test]
    fn test_save_replaces_previous_contents() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let mut set = sample_set();
        store.save(&set).unwrap();

        // Next merge drops the pending record.
        set.merge_page(Vec::new());
        store.save(&set).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.contains("c"));
    }

    #[test]
    fn test_load_empty() {
        let store = CheckpointStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_column_is_reported() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store.save(&sample_set()).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE records SET urls = 'not json' WHERE id = 'a'", [])
            .unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, StateError::Column { column: "urls", .. }));
    }

    #[tokio::test]
    async fn test_open_creates_db_and_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("painter_generations.db");
        let store = CheckpointStore::open(&path, false).await.unwrap();
        assert!(path.exists());
        assert!(with_suffix(&path, ".lock").exists());
        assert_eq!(store.path(), path);
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("painter_generations.db");
        let _first = CheckpointStore::open(&path, false).await.unwrap();
        let second = CheckpointStore::open(&path, false).await;
        assert!(matches!(second, Err(StateError::Locked { .. })));
    }

    #[tokio::test]
    async fn test_reopen_persists_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("painter_generations.db");
        {
            let store = CheckpointStore::open(&path, false).await.unwrap();
            store.save(&sample_set()).unwrap();
        }
        let store = CheckpointStore::open(&path, false).await.unwrap();
        assert_eq!(store.load().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("painter_generations.db");
        std::fs::write(&path, vec![0xABu8; 4096]).unwrap();

        let store = CheckpointStore::open(&path, false).await.unwrap();
        assert!(store.load().unwrap().is_empty());

        let moved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("painter_generations.db.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected_not_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("painter_generations.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        let err = CheckpointStore::open(&path, false).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::UnsupportedSchemaVersion { found: 99, .. }
        ));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rebuild_backs_up_and_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("painter_generations.db");
        {
            let store = CheckpointStore::open(&path, false).await.unwrap();
            store.save(&sample_set()).unwrap();
        }

        let store = CheckpointStore::open(&path, true).await.unwrap();
        assert!(store.load().unwrap().is_empty());

        let backup = with_suffix(&path, ".bak");
        let conn = Connection::open(&backup).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_backup_for_rebuild_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.db");
        assert!(CheckpointStore::backup_for_rebuild(&path).unwrap().is_none());
    }

    #[test]
    fn test_backup_removes_stale_side_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.db");
        std::fs::write(&path, b"db").unwrap();
        let backup = with_suffix(&path, ".bak");
        std::fs::write(with_suffix(&backup, "-wal"), b"stale").unwrap();

        let result = CheckpointStore::backup_for_rebuild(&path).unwrap();
        assert_eq!(result.as_deref(), Some(backup.as_path()));
        assert!(!path.exists());
        assert!(!with_suffix(&backup, "-wal").exists());
    }

    #[tokio::test]
    async fn test_snapshot_copies_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("painter_generations.db");
        let store = CheckpointStore::open(&path, false).await.unwrap();
        store.save(&sample_set()).unwrap();

        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let snap = store.snapshot(now).unwrap();
        assert_eq!(
            snap.file_name().unwrap().to_string_lossy(),
            "painter_generations_20240501_123045.db"
        );

        let conn = Connection::open(&snap).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);

        // Same second: the earlier snapshot is never overwritten.
        let second = store.snapshot(now).unwrap();
        assert_ne!(second, snap);
        assert!(snap.exists() && second.exists());
    }

    #[test]
    fn test_sync_run_and_summary() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store.save(&sample_set()).unwrap();

        let empty = store.summary().unwrap();
        assert!(empty.last_sync_started.is_none());

        let run = store.start_sync_run().unwrap();
        store
            .complete_sync_run(
                run,
                &SyncRunStats {
                    pages: 1,
                    fetched: 3,
                    admitted: 3,
                    assets_downloaded: 1,
                    assets_failed: 1,
                    interrupted: false,
                },
            )
            .unwrap();

        let summary = store.summary().unwrap();
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.downloaded_records, 1);
        assert_eq!(summary.pending_records, 2);
        assert_eq!(summary.records_with_failures, 1);
        assert_eq!(summary.failed_assets, 1);
        assert_eq!(summary.total_assets, 3);
        assert!(summary.last_sync_started.is_some());
        assert!(summary.last_sync_completed.is_some());
    }
}
