use std::time::Instant;

use chrono::{DateTime, Utc};
use keel_core::config::DatabaseKind;
use keel_core::error::{KeelError, Result};
use keel_core::migration::{AppliedMigration, Migration};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ledger_unavailable, Applier, BoxFuture, LockSettings, MigrationBackend, UnlockOutcome,
};

type LedgerRow = (String, String, String, DateTime<Utc>, i64);

/// SQLite backend.
///
/// SQLite has no advisory locks, so the migration lock is a single row in
/// `<table>_lock`. The primary key is pinned to 1, which makes the insert
/// that claims it succeed for exactly one holder.
pub struct SqliteBackend {
    pool: SqlitePool,
    table: String,
    lock: LockSettings,
    holder: String,
    applier: Applier<Sqlite>,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool, table: impl Into<String>, lock: LockSettings) -> Self {
        let table = table.into();
        let applier = Applier::new(
            format!("SELECT COUNT(*) FROM {} WHERE id = ?", table),
            format!(
                "INSERT INTO {} (id, description, checksum, applied_at, execution_time_ms) \
                 VALUES (?, ?, ?, ?, ?)",
                table
            ),
            format!("DELETE FROM {} WHERE id = ?", table),
        );
        Self {
            pool,
            table,
            lock,
            holder: Uuid::new_v4().to_string(),
            applier,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lock_table(&self) -> String {
        format!("{}_lock", self.table)
    }

    async fn ensure_lock_table(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )
            "#,
            self.lock_table()
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| KeelError::Lock(format!("Failed to create lock table: {}", e)))?;
        Ok(())
    }

    async fn connection(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| ledger_unavailable("Failed to acquire connection", e))
    }
}

impl MigrationBackend for SqliteBackend {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn ensure_ledger(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    checksum TEXT NOT NULL,
                    applied_at TEXT NOT NULL,
                    execution_time_ms INTEGER NOT NULL DEFAULT 0
                )
                "#,
                self.table
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| ledger_unavailable("Failed to create ledger table", e))?;
            Ok(())
        })
    }

    fn is_applied<'a>(&'a self, id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            self.applier.is_recorded(&mut *conn, id).await
        })
    }

    fn applied(&self) -> BoxFuture<'_, Vec<AppliedMigration>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT id, description, checksum, applied_at, execution_time_ms \
                 FROM {} ORDER BY applied_at ASC, rowid ASC",
                self.table
            );
            let rows: Vec<LedgerRow> = sqlx::query_as(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ledger_unavailable("Failed to read ledger", e))?;

            Ok(rows
                .into_iter()
                .map(
                    |(id, description, checksum, applied_at, execution_time_ms)| AppliedMigration {
                        id,
                        description,
                        checksum,
                        applied_at,
                        execution_time_ms,
                    },
                )
                .collect())
        })
    }

    fn apply<'a>(&'a self, migration: &'a Migration) -> BoxFuture<'a, AppliedMigration> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            self.applier.apply(&mut *conn, migration).await
        })
    }

    fn revert<'a>(&'a self, migration: &'a Migration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            self.applier.revert(&mut *conn, migration).await
        })
    }

    fn acquire_lock(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_lock_table().await?;

            debug!(holder = %self.holder, "Acquiring migration lock...");
            let sql = format!(
                "INSERT OR IGNORE INTO {} (id, holder, acquired_at) VALUES (1, ?, ?)",
                self.lock_table()
            );
            let deadline = Instant::now() + self.lock.timeout;

            loop {
                let result = sqlx::query(&sql)
                    .bind(&self.holder)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        KeelError::Lock(format!("Failed to acquire migration lock: {}", e))
                    })?;

                if result.rows_affected() == 1 {
                    debug!("Migration lock acquired");
                    return Ok(());
                }

                if Instant::now() >= deadline {
                    return Err(KeelError::LockTimeout(self.lock.timeout));
                }

                debug!("Migration lock held by another process, waiting");
                tokio::time::sleep(self.lock.poll_interval).await;
            }
        })
    }

    fn release_lock(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!("DELETE FROM {} WHERE id = 1 AND holder = ?", self.lock_table());
            let result = sqlx::query(&sql)
                .bind(&self.holder)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    KeelError::Lock(format!("Failed to release migration lock: {}", e))
                })?;

            if result.rows_affected() == 0 {
                warn!("Migration lock was not held by this process");
            } else {
                debug!("Migration lock released");
            }
            Ok(())
        })
    }

    fn force_unlock(&self) -> BoxFuture<'_, UnlockOutcome> {
        Box::pin(async move {
            self.ensure_lock_table().await?;

            let select = format!("SELECT holder, acquired_at FROM {}", self.lock_table());
            let held: Option<(String, DateTime<Utc>)> = sqlx::query_as(&select)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| KeelError::Lock(format!("Failed to read migration lock: {}", e)))?;

            let Some((holder, acquired_at)) = held else {
                debug!("Migration lock is not held");
                return Ok(UnlockOutcome::NotHeld);
            };

            let delete = format!("DELETE FROM {} WHERE holder = ?", self.lock_table());
            sqlx::query(&delete)
                .bind(&holder)
                .execute(&self.pool)
                .await
                .map_err(|e| KeelError::Lock(format!("Failed to clear migration lock: {}", e)))?;

            warn!(%holder, %acquired_at, "Cleared migration lock");
            Ok(UnlockOutcome::Cleared {
                holder,
                acquired_at,
            })
        })
    }
}
