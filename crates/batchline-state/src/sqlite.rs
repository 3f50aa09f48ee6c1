//! `SQLite`-backed implementation of [`CheckpointStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety; the mutex also
//! serializes writers, and the primary key on `(run_id, stage,
//! idempotency_key)` enforces the append-only invariant at the storage
//! layer.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use batchline_types::checkpoint::{Checkpoint, CheckpointStatus};
use batchline_types::ids::{RunId, StageName};
use rusqlite::Connection;

use crate::error::{self, StateError};
use crate::store::CheckpointStore;

/// Idempotent DDL for the checkpoint table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    status TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    output_fingerprint TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    output_batch TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    rows_skipped INTEGER NOT NULL DEFAULT 0,
    inserted_seq INTEGER,
    PRIMARY KEY (run_id, stage, idempotency_key)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints (run_id);
";

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteCheckpointStore::open`] for file-backed
/// persistence or [`SqliteCheckpointStore::in_memory`] for tests.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create a `SQLite` checkpoint database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn row_to_checkpoint(
        run_id: String,
        stage: String,
        key: String,
        status: String,
        recorded_at: String,
        fingerprint: String,
        attempts: i64,
        output_json: Option<String>,
        rows_written: i64,
        rows_skipped: i64,
    ) -> error::Result<Checkpoint> {
        let output_batch = match output_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Checkpoint {
            run_id: RunId::new(run_id),
            stage_name: StageName::new(stage),
            idempotency_key: key,
            status: CheckpointStatus::parse(&status).unwrap_or(CheckpointStatus::Failed),
            recorded_at,
            output_fingerprint: fingerprint,
            attempts: u32::try_from(attempts).unwrap_or(0),
            output_batch,
            rows_written: u64::try_from(rows_written).unwrap_or(0),
            rows_skipped: u64::try_from(rows_skipped).unwrap_or(0),
        })
    }
}

type CheckpointRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    i64,
    i64,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(
        &self,
        run_id: &RunId,
        stage_name: &StageName,
        key: &str,
    ) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT run_id, stage, idempotency_key, status, recorded_at, output_fingerprint, \
             attempts, output_batch, rows_written, rows_skipped \
             FROM checkpoints WHERE run_id = ?1 AND stage = ?2 AND idempotency_key = ?3",
            rusqlite::params![run_id.as_str(), stage_name.as_str(), key],
            read_row,
        );

        match result {
            Ok((rid, stage, k, status, at, fp, attempts, output, written, skipped)) => {
                Ok(Some(Self::row_to_checkpoint(
                    rid, stage, k, status, at, fp, attempts, output, written, skipped,
                )?))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StateError::Sqlite(e)),
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn put(&self, checkpoint: &Checkpoint) -> error::Result<()> {
        let conn = self.lock_conn()?;

        let existing = conn
            .query_row(
                "SELECT status, output_fingerprint FROM checkpoints \
                 WHERE run_id = ?1 AND stage = ?2 AND idempotency_key = ?3",
                rusqlite::params![
                    checkpoint.run_id.as_str(),
                    checkpoint.stage_name.as_str(),
                    checkpoint.idempotency_key,
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StateError::Sqlite(other)),
            })?;

        if let Some((status, fingerprint)) = existing {
            let status = CheckpointStatus::parse(&status).unwrap_or(CheckpointStatus::Failed);
            let identical = status == checkpoint.status
                && fingerprint == checkpoint.output_fingerprint;
            if identical {
                return Ok(());
            }
            if status == CheckpointStatus::Completed {
                return Err(StateError::Conflict {
                    run_id: checkpoint.run_id.as_str().to_string(),
                    stage: checkpoint.stage_name.as_str().to_string(),
                    key: checkpoint.idempotency_key.clone(),
                });
            }
            // Existing FAILED record: superseded by the new conclusion.
        }

        let output_json = checkpoint
            .output_batch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO checkpoints \
             (run_id, stage, idempotency_key, status, recorded_at, output_fingerprint, \
              attempts, output_batch, rows_written, rows_skipped, inserted_seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                     (SELECT COALESCE(MAX(inserted_seq), 0) + 1 FROM checkpoints)) \
             ON CONFLICT(run_id, stage, idempotency_key) DO UPDATE SET \
               status = ?4, recorded_at = ?5, output_fingerprint = ?6, attempts = ?7, \
               output_batch = ?8, rows_written = ?9, rows_skipped = ?10",
            rusqlite::params![
                checkpoint.run_id.as_str(),
                checkpoint.stage_name.as_str(),
                checkpoint.idempotency_key,
                checkpoint.status.as_str(),
                checkpoint.recorded_at,
                checkpoint.output_fingerprint,
                i64::from(checkpoint.attempts),
                output_json,
                checkpoint.rows_written as i64,
                checkpoint.rows_skipped as i64,
            ],
        )?;
        Ok(())
    }

    fn list_for_run(&self, run_id: &RunId) -> error::Result<Vec<Checkpoint>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, stage, idempotency_key, status, recorded_at, output_fingerprint, \
             attempts, output_batch, rows_written, rows_skipped \
             FROM checkpoints WHERE run_id = ?1 ORDER BY inserted_seq",
        )?;

        let rows = stmt
            .query_map(rusqlite::params![run_id.as_str()], read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(rid, stage, k, status, at, fp, attempts, output, written, skipped)| {
                Self::row_to_checkpoint(
                    rid, stage, k, status, at, fp, attempts, output, written, skipped,
                )
            })
            .collect()
    }
}
