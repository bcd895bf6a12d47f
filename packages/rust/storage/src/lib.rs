//! Turso Embedded / libSQL storage layer for run bookkeeping.
//!
//! The [`Storage`] struct wraps a libSQL database holding one row per
//! pipeline run and the append-only batch log of every chunk attempt.
//!
//! **Access rules:**
//! - The pipeline writes via [`Storage::open`]
//! - Inspection commands read via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, Row, params};
use linetag_shared::{BatchLogEntry, LinetagError, PassKind, Result, RunId};

/// A row of the `runs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRow {
    pub id: String,
    pub run_date: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub stats_json: Option<String>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: libsql::Error) -> LinetagError {
    LinetagError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LinetagError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LinetagError::Storage(format!(
                "no run database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    LinetagError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LinetagError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(&self, run_id: &RunId, run_date: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, run_date, started_at) VALUES (?1, ?2, ?3)",
                params![run_id.to_string(), run_date, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Mark a run finished with its final status and summary counts.
    pub async fn finish_run(&self, run_id: &RunId, status: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2, stats_json = ?3 WHERE id = ?4",
                params![now.as_str(), status, stats_json, run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        if updated == 0 {
            return Err(LinetagError::Storage(format!("unknown run {run_id}")));
        }
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, run_date, started_at, finished_at, status, stats_json
                 FROM runs WHERE id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Most recently started run for a run date.
    pub async fn latest_run_for_date(&self, run_date: &str) -> Result<Option<RunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, run_date, started_at, finished_at, status, stats_json
                 FROM runs WHERE run_date = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![run_date],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Batch log operations
    // -----------------------------------------------------------------------

    /// Append one attempt to the batch log.
    pub async fn append_batch_log(&self, run_id: &RunId, entry: &BatchLogEntry) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO batch_log
                   (run_id, pass, chunk_index, attempt, outcome, records, error_kind, error, duration_ms, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id.to_string(),
                    entry.pass.as_str(),
                    entry.chunk_index as i64,
                    i64::from(entry.attempt),
                    entry.outcome.as_str(),
                    entry.records as i64,
                    entry.error_kind.as_deref(),
                    entry.error.as_deref(),
                    entry.duration_ms as i64,
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Batch log of a run, ordered by pass, chunk index and attempt.
    pub async fn list_batch_log(
        &self,
        run_id: &RunId,
        pass: Option<PassKind>,
    ) -> Result<Vec<BatchLogEntry>> {
        let sql = "SELECT pass, chunk_index, attempt, outcome, records, error_kind, error, duration_ms
                   FROM batch_log
                   WHERE run_id = ?1 AND (?2 IS NULL OR pass = ?2)
                   ORDER BY CASE pass WHEN 'line' THEN 0 ELSE 1 END, chunk_index, attempt";
        let mut rows = self
            .conn
            .query(sql, params![run_id.to_string(), pass.map(|p| p.as_str())])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_log_entry(&row)?);
        }
        Ok(results)
    }
}

/// Convert a libSQL row to a [`RunRow`].
fn row_to_run(row: &Row) -> Result<RunRow> {
    Ok(RunRow {
        id: row.get::<String>(0).map_err(storage_err)?,
        run_date: row.get::<String>(1).map_err(storage_err)?,
        started_at: row.get::<String>(2).map_err(storage_err)?,
        finished_at: row.get::<String>(3).ok(),
        status: row.get::<String>(4).map_err(storage_err)?,
        stats_json: row.get::<String>(5).ok(),
    })
}

/// Convert a libSQL row to a [`BatchLogEntry`].
fn row_to_log_entry(row: &Row) -> Result<BatchLogEntry> {
    let pass: String = row.get(0).map_err(storage_err)?;
    let outcome: String = row.get(3).map_err(storage_err)?;
    Ok(BatchLogEntry {
        pass: pass.parse()?,
        chunk_index: row.get::<i64>(1).map_err(storage_err)? as usize,
        attempt: row.get::<i64>(2).map_err(storage_err)? as u32,
        outcome: outcome.parse()?,
        records: row.get::<i64>(4).map_err(storage_err)? as usize,
        error_kind: row.get::<String>(5).ok(),
        error: row.get::<String>(6).ok(),
        duration_ms: row.get::<i64>(7).map_err(storage_err)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use linetag_shared::AttemptOutcome;
    use uuid::Uuid;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("lt_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn entry(pass: PassKind, chunk: usize, attempt: u32, outcome: AttemptOutcome) -> BatchLogEntry {
        let failed = outcome != AttemptOutcome::Success;
        BatchLogEntry {
            pass,
            chunk_index: chunk,
            attempt,
            outcome,
            records: 5,
            error_kind: failed.then(|| "backend".to_string()),
            error: failed.then(|| "HTTP 503".to_string()),
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn fresh_db_has_schema() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("lt_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let storage = test_storage().await;
        let run_id = RunId::new();

        storage
            .insert_run(&run_id, "2026-10-12")
            .await
            .expect("insert run");
        let run = storage.get_run(&run_id).await.unwrap().expect("run exists");
        assert_eq!(run.status, "running");
        assert!(run.finished_at.is_none());

        storage
            .finish_run(&run_id, "partial_success", r#"{"chunks_failed": 1}"#)
            .await
            .expect("finish run");
        let run = storage
            .latest_run_for_date("2026-10-12")
            .await
            .unwrap()
            .expect("latest run");
        assert_eq!(run.id, run_id.to_string());
        assert_eq!(run.status, "partial_success");
        assert!(run.stats_json.unwrap().contains("chunks_failed"));

        assert!(storage.latest_run_for_date("2026-10-19").await.unwrap().is_none());
        assert!(storage.finish_run(&RunId::new(), "success", "{}").await.is_err());
    }

    #[tokio::test]
    async fn batch_log_ordering_and_filter() {
        let storage = test_storage().await;
        let run_id = RunId::new();
        storage.insert_run(&run_id, "2026-10-12").await.unwrap();

        // Appended in completion order, not key order.
        for e in [
            entry(PassKind::Item, 0, 1, AttemptOutcome::Success),
            entry(PassKind::Line, 1, 2, AttemptOutcome::Success),
            entry(PassKind::Line, 1, 1, AttemptOutcome::Retry),
            entry(PassKind::Line, 0, 1, AttemptOutcome::Success),
        ] {
            storage.append_batch_log(&run_id, &e).await.expect("append");
        }

        let all = storage.list_batch_log(&run_id, None).await.unwrap();
        let keys: Vec<(PassKind, usize, u32)> =
            all.iter().map(|e| (e.pass, e.chunk_index, e.attempt)).collect();
        assert_eq!(
            keys,
            vec![
                (PassKind::Line, 0, 1),
                (PassKind::Line, 1, 1),
                (PassKind::Line, 1, 2),
                (PassKind::Item, 0, 1),
            ]
        );
        assert_eq!(all[1].outcome, AttemptOutcome::Retry);
        assert_eq!(all[1].error_kind.as_deref(), Some("backend"));
        assert!(all[0].error.is_none());

        let item_only = storage
            .list_batch_log(&run_id, Some(PassKind::Item))
            .await
            .unwrap();
        assert_eq!(item_only.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_attempt_key_rejected() {
        let storage = test_storage().await;
        let run_id = RunId::new();
        storage.insert_run(&run_id, "2026-10-12").await.unwrap();

        let e = entry(PassKind::Line, 0, 1, AttemptOutcome::Success);
        storage.append_batch_log(&run_id, &e).await.unwrap();
        assert!(storage.append_batch_log(&run_id, &e).await.is_err());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("lt_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_run(&RunId::new(), "2026-10-12").await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.insert_run(&RunId::new(), "2026-10-12").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
