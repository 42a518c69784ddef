//! KEEL - versioned schema migrations for PostgreSQL and SQLite.
//!
//! Migrations are plain SQL files with `-- @up` and `-- @down` sections.
//! Applied migrations are recorded in a ledger table, and every mutating
//! operation runs under a cross-process lock so concurrent deployments
//! apply each migration exactly once.

pub mod cli;

pub use keel_core::config::KeelConfig;
pub use keel_core::error::{KeelError, Result};
pub use keel_core::migration::{AppliedMigration, Migration, MigrationStatus, RunReport};
pub use keel_core::registry::MigrationRegistry;
pub use keel_runtime::{load_migrations_from_dir, load_registry, Database, Migrator};
