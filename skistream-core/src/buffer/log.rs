use std::path::Path;
use std::time::Duration;

use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::debug;

use crate::Result;
use crate::buffer::{BufferedRecord, LogType, SequenceId};

/// One log's physical storage: a SQLite file holding a single table named after the log.
///
/// The pool holds exactly one connection. That connection is the log's critical section, every
/// statement against this log waits for it, and statements against other logs never do.
#[derive(Clone)]
pub(super) struct LogStore {
    log: LogType,
    pool: SqlitePool,
}

impl LogStore {
    pub(super) async fn open(log: LogType, dir: &Path, lock_timeout: Duration) -> Result<Self> {
        let path = dir.join(log.file_name());

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(lock_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(lock_timeout)
            .connect_with(options)
            .await?;

        debug!(%log, path = %path.display(), "Opened log storage");
        Ok(Self { log, pool })
    }

    pub(super) async fn create_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (ID INTEGER PRIMARY KEY AUTOINCREMENT, DATA TEXT NOT NULL)",
            self.log.as_str()
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Inserts in its own implicit transaction; the returned id is committed.
    pub(super) async fn insert(&self, payload: &str) -> Result<SequenceId> {
        let sql = format!("INSERT INTO {} (DATA) VALUES (?)", self.log.as_str());
        let result = sqlx::query(&sql)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub(super) async fn select_after(
        &self,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<BufferedRecord>> {
        let sql = format!(
            "SELECT ID, DATA FROM {} WHERE ID > ? ORDER BY ID ASC LIMIT ?",
            self.log.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<BufferedRecord> {
                Ok(BufferedRecord {
                    sequence_id: row.try_get("ID")?,
                    payload: row.try_get("DATA")?,
                })
            })
            .collect()
    }

    pub(super) async fn delete_up_to(&self, sequence_id: SequenceId) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE ID <= ?", self.log.as_str());
        let result = sqlx::query(&sql)
            .bind(sequence_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub(super) async fn count(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.log.as_str());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    pub(super) async fn close(&self) {
        self.pool.close().await;
    }
}
