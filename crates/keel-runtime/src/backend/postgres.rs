use std::time::Instant;

use chrono::{DateTime, Utc};
use keel_core::config::DatabaseKind;
use keel_core::error::{KeelError, Result};
use keel_core::migration::{AppliedMigration, Migration};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    advisory_lock_key, ledger_unavailable, Applier, BoxFuture, LockSettings, MigrationBackend,
    UnlockOutcome,
};

type LedgerRow = (String, String, String, DateTime<Utc>, i64);

/// PostgreSQL backend.
///
/// Mutual exclusion uses a session-level advisory lock. The session that
/// takes the lock is kept out of the pool until the lock is released, so the
/// unlock runs on the same connection.
pub struct PostgresBackend {
    pool: PgPool,
    table: String,
    lock_key: i64,
    lock: LockSettings,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
    applier: Applier<Postgres>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool, table: impl Into<String>, lock: LockSettings) -> Self {
        let table = table.into();
        let applier = Applier::new(
            format!("SELECT COUNT(*) FROM {} WHERE id = $1", table),
            format!(
                "INSERT INTO {} (id, description, checksum, applied_at, execution_time_ms) \
                 VALUES ($1, $2, $3, $4, $5)",
                table
            ),
            format!("DELETE FROM {} WHERE id = $1", table),
        );
        Self {
            pool,
            lock_key: advisory_lock_key(&table),
            table,
            lock,
            lock_conn: Mutex::new(None),
            applier,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn connection(&self) -> Result<PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| ledger_unavailable("Failed to acquire connection", e))
    }
}

impl MigrationBackend for PostgresBackend {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn ensure_ledger(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(255) PRIMARY KEY,
                    description TEXT NOT NULL DEFAULT '',
                    checksum VARCHAR(64) NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    execution_time_ms BIGINT NOT NULL DEFAULT 0
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
                 FROM {} ORDER BY applied_at ASC, id ASC",
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
            let mut slot = self.lock_conn.lock().await;
            if slot.is_some() {
                return Err(KeelError::Lock(
                    "migration lock is already held by this process".into(),
                ));
            }

            debug!("Acquiring migration lock...");
            let mut conn = self.pool.acquire().await.map_err(|e| {
                KeelError::Lock(format!("Failed to acquire connection for lock: {}", e))
            })?;

            let deadline = Instant::now() + self.lock.timeout;
            loop {
                let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                    .bind(self.lock_key)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| {
                        KeelError::Lock(format!("Failed to acquire migration lock: {}", e))
                    })?;

                if acquired {
                    *slot = Some(conn);
                    debug!("Migration lock acquired");
                    return Ok(());
                }

                if Instant::now() >= deadline {
                    return Err(KeelError::LockTimeout(self.lock.timeout));
                }

                debug!("Migration lock held by another session, waiting");
                tokio::time::sleep(self.lock.poll_interval).await;
            }
        })
    }

    fn release_lock(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(mut conn) = self.lock_conn.lock().await.take() else {
                return Ok(());
            };

            let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_key)
                .fetch_one(&mut *conn)
                .await;

            match released {
                Ok(true) => {
                    debug!("Migration lock released");
                    Ok(())
                }
                Ok(false) => {
                    warn!("Migration lock was not held by this session");
                    Ok(())
                }
                Err(e) => {
                    // Closing the session drops its advisory locks
                    let _ = conn.close().await;
                    Err(KeelError::Lock(format!(
                        "Failed to release migration lock: {}",
                        e
                    )))
                }
            }
        })
    }

    fn force_unlock(&self) -> BoxFuture<'_, UnlockOutcome> {
        Box::pin(async move {
            // Advisory locks end with their session, so all we can do is
            // report who holds ours. The bigint key is split across
            // classid (high half) and objid (low half).
            let pids: Vec<i32> = sqlx::query_scalar(
                "SELECT pid FROM pg_locks \
                 WHERE locktype = 'advisory' AND granted AND objsubid = 1 \
                 AND ((classid::bigint << 32) | objid::bigint) = $1",
            )
            .bind(self.lock_key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KeelError::Lock(format!("Failed to inspect migration lock: {}", e)))?;

            if pids.is_empty() {
                debug!("Migration lock is not held");
                return Ok(UnlockOutcome::NotHeld);
            }
            warn!(?pids, "Migration lock is held by live sessions");
            Ok(UnlockOutcome::HeldBySessions(pids))
        })
    }
}
