//! Dialect-specific ledger, applier and lock implementations.
//!
//! A backend owns everything that touches the target database: the ledger
//! table, running one migration's statements together with its ledger write,
//! and the cross-process migration lock.

mod applier;
mod postgres;
mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

pub(crate) use applier::Applier;

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use keel_core::config::{DatabaseKind, MigrationsConfig};
use keel_core::error::{KeelError, Result};
use keel_core::migration::{AppliedMigration, Migration};

use crate::migrations::split_sql_statements;

/// Boxed future returned by backend operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage and execution backend for the migration engine.
pub trait MigrationBackend: Send + Sync {
    /// Which database engine this backend talks to.
    fn kind(&self) -> DatabaseKind;

    /// Create the ledger table if it does not exist.
    fn ensure_ledger(&self) -> BoxFuture<'_, ()>;

    /// Whether the ledger has an entry for `id`. Never creates the ledger;
    /// a missing table is `LedgerUnavailable`.
    fn is_applied<'a>(&'a self, id: &'a str) -> BoxFuture<'a, bool>;

    /// All ledger entries, oldest first.
    fn applied(&self) -> BoxFuture<'_, Vec<AppliedMigration>>;

    /// Run `up` and insert the ledger entry as one unit.
    fn apply<'a>(&'a self, migration: &'a Migration) -> BoxFuture<'a, AppliedMigration>;

    /// Run `down` and delete the ledger entry as one unit.
    fn revert<'a>(&'a self, migration: &'a Migration) -> BoxFuture<'a, ()>;

    /// Block until this process holds the migration lock or the timeout passes.
    fn acquire_lock(&self) -> BoxFuture<'_, ()>;

    /// Release the lock taken by `acquire_lock`. No-op when not held.
    fn release_lock(&self) -> BoxFuture<'_, ()>;

    /// Clear a lock left behind by a process that died while holding it.
    fn force_unlock(&self) -> BoxFuture<'_, UnlockOutcome>;
}

/// What `force_unlock` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Nobody held the lock.
    NotHeld,
    /// A stale lock row was removed.
    Cleared {
        holder: String,
        acquired_at: DateTime<Utc>,
    },
    /// Live database sessions hold the lock; it ends with them and cannot be
    /// cleared from outside.
    HeldBySessions(Vec<i32>),
}

/// Lock acquisition settings shared by all backends.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl LockSettings {
    pub fn from_config(config: &MigrationsConfig) -> Self {
        Self {
            timeout: config.lock_timeout(),
            poll_interval: config.lock_poll_interval(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from_config(&MigrationsConfig::default())
    }
}

/// The statements of a migration section, refusing empty ones.
pub(crate) fn statements(migration: &Migration, sql: &str) -> Result<Vec<String>> {
    let statements = split_sql_statements(sql);
    if statements.is_empty() {
        return Err(KeelError::InvalidMigration(format!(
            "migration '{}' has no statements to run",
            migration.id
        )));
    }
    Ok(statements)
}

pub(crate) fn ledger_entry(migration: &Migration, started: Instant) -> AppliedMigration {
    AppliedMigration {
        id: migration.id.clone(),
        description: migration.description.clone(),
        checksum: migration.checksum(),
        applied_at: Utc::now(),
        execution_time_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
    }
}

pub(crate) fn ledger_unavailable(context: &str, e: sqlx::Error) -> KeelError {
    KeelError::LedgerUnavailable(format!("{}: {}", context, e))
}

/// `statement` is 1-based. Outside a transaction, statements before it
/// have already taken effect.
pub(crate) fn schema_change(migration: &Migration, statement: usize, e: sqlx::Error) -> KeelError {
    KeelError::SchemaChange {
        migration: migration.id.clone(),
        statement,
        schema_committed: !migration.transactional && statement > 1,
        message: e.to_string(),
    }
}

pub(crate) fn ledger_write(
    migration: &Migration,
    schema_committed: bool,
    e: sqlx::Error,
) -> KeelError {
    KeelError::LedgerWrite {
        migration: migration.id.clone(),
        schema_committed,
        message: e.to_string(),
    }
}

/// Advisory lock key for a ledger table, so differently-named ledgers in the
/// same database do not block each other.
pub(crate) fn advisory_lock_key(table: &str) -> i64 {
    // FNV-1a, seeded with "KEEL"
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ 0x4B45_454C;
    for byte in table.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as i64
}
