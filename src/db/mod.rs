/// Database layer for the Meridian PDS
///
/// All state lives in a single sqlite file. Sqlite has one writer at a time,
/// so every write path goes through this gateway's mutex; reads use the pool
/// directly. Holding the same mutex is also how backup snapshots quiesce the
/// file without stopping reads.
use crate::error::{PdsError, PdsResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serialized gateway over the sqlite pool
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

/// A write transaction holding the gateway lock for its whole lifetime
pub struct WriteTx {
    _guard: OwnedMutexGuard<()>,
    pub tx: sqlx::Transaction<'static, sqlx::Sqlite>,
}

impl WriteTx {
    pub async fn commit(self) -> PdsResult<()> {
        self.tx.commit().await.map_err(PdsError::Database)
    }

    pub async fn rollback(self) -> PdsResult<()> {
        self.tx.rollback().await.map_err(PdsError::Database)
    }
}

impl Db {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Pool handle for reads. Reads are unsynchronized.
    pub fn reader(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the write lock without starting a transaction. Used by the
    /// backup snapshotter to quiesce writers.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.write_lock).lock_owned().await
    }

    /// Run a single write statement under the gateway lock.
    pub async fn exec<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> PdsResult<sqlx::sqlite::SqliteQueryResult> {
        let _guard = self.write_lock.lock().await;
        query.execute(&self.pool).await.map_err(PdsError::Database)
    }

    /// Begin a transaction that holds the gateway lock until commit/rollback.
    pub async fn begin(&self) -> PdsResult<WriteTx> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let tx = self.pool.begin().await.map_err(PdsError::Database)?;
        Ok(WriteTx { _guard: guard, tx })
    }

    /// Begin a transaction WITHOUT taking the gateway lock. Only valid when
    /// the caller already holds the lock through another handle.
    pub async fn begin_dangerously(
        &self,
    ) -> PdsResult<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.pool.begin().await.map_err(PdsError::Database)
    }
}

/// Create the sqlite connection pool
pub async fn create_pool(path: &Path) -> PdsResult<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5)),
    )
    .await
    .map_err(PdsError::Database)?;

    Ok(pool)
}

/// In-memory pool for tests. A single connection, since every sqlite
/// `:memory:` connection is its own database.
pub async fn create_test_pool() -> PdsResult<SqlitePool> {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(PdsError::Database)
}

/// Run migrations, embedded at compile time from ./migrations
pub async fn run_migrations(pool: &SqlitePool) -> PdsResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PdsError::Internal(format!("Migration failed: {}", e)))?;

    Ok(())
}
