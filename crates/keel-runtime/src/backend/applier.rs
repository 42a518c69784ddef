use std::marker::PhantomData;
use std::time::Instant;

use chrono::{DateTime, Utc};
use keel_core::error::{KeelError, Result};
use keel_core::migration::{AppliedMigration, Migration};
use sqlx::{ColumnIndex, Connection, Database, Decode, Encode, Executor, IntoArguments, Type};

use super::{ledger_entry, ledger_unavailable, ledger_write, schema_change, statements};

/// Runs one migration's statements together with its ledger write.
///
/// Only the ledger SQL differs between dialects; the backends hand it in
/// with their own placeholder syntax.
pub(crate) struct Applier<DB> {
    exists_sql: String,
    insert_sql: String,
    delete_sql: String,
    _db: PhantomData<fn() -> DB>,
}

impl<DB> Applier<DB> {
    /// `exists_sql` takes the id; `insert_sql` takes id, description,
    /// checksum, applied_at and execution_time_ms; `delete_sql` takes the id.
    pub(crate) fn new(exists_sql: String, insert_sql: String, delete_sql: String) -> Self {
        Self {
            exists_sql,
            insert_sql,
            delete_sql,
            _db: PhantomData,
        }
    }
}

impl<DB> Applier<DB>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    for<'q> String: Encode<'q, DB> + Type<DB>,
    for<'q> DateTime<Utc>: Encode<'q, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB>,
    for<'r> i64: Decode<'r, DB> + Type<DB>,
    usize: ColumnIndex<DB::Row>,
{
    pub(crate) async fn is_recorded(&self, conn: &mut DB::Connection, id: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<DB, i64>(&self.exists_sql)
            .bind(id.to_string())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ledger_unavailable("Failed to read ledger", e))?;
        Ok(count > 0)
    }

    /// Run `up` and insert the ledger entry, inside one transaction unless
    /// the migration opts out.
    pub(crate) async fn apply(
        &self,
        conn: &mut DB::Connection,
        migration: &Migration,
    ) -> Result<AppliedMigration> {
        let started = Instant::now();

        if !migration.transactional {
            return self.apply_steps(conn, migration, started).await;
        }

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| ledger_unavailable("Failed to begin transaction", e))?;
        let entry = self.apply_steps(&mut *tx, migration, started).await?;
        tx.commit()
            .await
            .map_err(|e| ledger_write(migration, false, e))?;

        Ok(entry)
    }

    /// Run `down` and delete the ledger entry, inside one transaction unless
    /// the migration opts out.
    pub(crate) async fn revert(
        &self,
        conn: &mut DB::Connection,
        migration: &Migration,
    ) -> Result<()> {
        if !migration.transactional {
            return self.revert_steps(conn, migration).await;
        }

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| ledger_unavailable("Failed to begin transaction", e))?;
        self.revert_steps(&mut *tx, migration).await?;
        tx.commit()
            .await
            .map_err(|e| ledger_write(migration, false, e))?;

        Ok(())
    }

    async fn apply_steps(
        &self,
        conn: &mut DB::Connection,
        migration: &Migration,
        started: Instant,
    ) -> Result<AppliedMigration> {
        if self.is_recorded(conn, &migration.id).await? {
            return Err(KeelError::AlreadyApplied(migration.id.clone()));
        }

        self.run_section(conn, migration, &migration.up).await?;

        let entry = ledger_entry(migration, started);
        sqlx::query::<DB>(&self.insert_sql)
            .bind(entry.id.clone())
            .bind(entry.description.clone())
            .bind(entry.checksum.clone())
            .bind(entry.applied_at)
            .bind(entry.execution_time_ms)
            .execute(&mut *conn)
            .await
            .map_err(|e| ledger_write(migration, !migration.transactional, e))?;

        Ok(entry)
    }

    async fn revert_steps(&self, conn: &mut DB::Connection, migration: &Migration) -> Result<()> {
        if !self.is_recorded(conn, &migration.id).await? {
            return Err(KeelError::NotApplied(migration.id.clone()));
        }

        let down = migration
            .down
            .as_deref()
            .ok_or_else(|| KeelError::Irreversible(migration.id.clone()))?;
        self.run_section(conn, migration, down).await?;

        sqlx::query::<DB>(&self.delete_sql)
            .bind(migration.id.clone())
            .execute(&mut *conn)
            .await
            .map_err(|e| ledger_write(migration, !migration.transactional, e))?;

        Ok(())
    }

    async fn run_section(
        &self,
        conn: &mut DB::Connection,
        migration: &Migration,
        sql: &str,
    ) -> Result<()> {
        for (i, statement) in statements(migration, sql)?.iter().enumerate() {
            sqlx::query::<DB>(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| schema_change(migration, i + 1, e))?;
        }
        Ok(())
    }
}
