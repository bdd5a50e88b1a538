use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction, migrate::Migrator};
use thiserror::Error;
use xiaoya_core::FileRecord;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// File name of the download and served indexes inside their directories.
pub const INDEX_FILE_NAME: &str = ".metadata.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Path-keyed file index backed by one SQLite file.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the index file at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn connections_in_use(&self) -> usize {
        self.pool.size() as usize - self.pool.num_idle()
    }

    pub async fn begin(&self) -> Result<IndexTx, IndexError> {
        Ok(IndexTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query("SELECT path, name, size, modified, etag FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<FileRecord>, IndexError> {
        let rows = sqlx::query("SELECT path, name, size, modified, etag FROM files ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Upsert outside any transaction.
    pub async fn upsert(&self, record: &FileRecord) -> Result<(), IndexError> {
        upsert_query(record).execute(&self.pool).await?;
        Ok(())
    }
}

/// A write transaction on an [`IndexStore`]. Dropping it without
/// [`IndexTx::commit`] rolls every change back.
pub struct IndexTx {
    tx: Transaction<'static, Sqlite>,
}

impl IndexTx {
    pub async fn upsert(&mut self, record: &FileRecord) -> Result<(), IndexError> {
        upsert_query(record).execute(&mut *self.tx).await?;
        Ok(())
    }

    pub async fn delete(&mut self, path: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), IndexError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn upsert_query(
    record: &FileRecord,
) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO files (path, name, size, modified, etag)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
             name = excluded.name,
             size = excluded.size,
             modified = excluded.modified,
             etag = excluded.etag",
    )
    .bind(&record.path)
    .bind(&record.name)
    .bind(record.size)
    .bind(record.modified)
    .bind(&record.etag)
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, IndexError> {
    let path: String = row.try_get("path")?;
    let name: Option<String> = row.try_get("name")?;
    let size: Option<i64> = row.try_get("size")?;
    let modified: Option<i64> = row.try_get("modified")?;
    let etag: Option<String> = row.try_get("etag")?;

    let mut record = FileRecord::file(
        path,
        size.unwrap_or_default(),
        modified.unwrap_or_default(),
        etag.unwrap_or_default(),
    );
    if let Some(name) = name.filter(|name| !name.is_empty()) {
        record.name = name;
    }
    Ok(record)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
