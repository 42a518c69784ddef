pub mod backend;
pub mod db;
pub mod migrations;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{
    LockSettings, MigrationBackend, PostgresBackend, SqliteBackend, UnlockOutcome,
};
pub use db::Database;
pub use migrations::{load_migrations_from_dir, load_registry, Migrator};
