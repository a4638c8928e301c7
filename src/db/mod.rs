pub mod models;

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::config::Config;
use crate::error::Result;

/// Shared handle to the points database. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

/// One all-or-nothing unit of work.
///
/// Opened with `BEGIN IMMEDIATE`, so the SQLite write lock is held from the first
/// statement and read-validate-write sequences cannot interleave with other writers.
/// Dropping it without calling [`UnitOfWork::commit`] rolls everything back.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl Db {
    /// Opens (creating if needed) the database at `cfg.db_path` and applies migrations.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(cfg.db_busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.db_max_connections.max(1))
            .connect_with(opts)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<UnitOfWork> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(UnitOfWork { tx })
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl UnitOfWork {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl Deref for UnitOfWork {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for UnitOfWork {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}
