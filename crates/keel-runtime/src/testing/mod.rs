//! Explicit database provisioning for tests.
//!
//! SQLite in-memory databases need no setup and back most engine tests.
//! PostgreSQL is only used when TEST_DATABASE_URL is set; the .env file
//! DATABASE_URL is NEVER read, so tests cannot touch a real database by
//! accident.

use std::sync::Arc;

use keel_core::config::{DatabaseConfig, MigrationsConfig};
use keel_core::error::{KeelError, Result};
use keel_core::migration::Migration;
use keel_core::registry::MigrationRegistry;
use uuid::Uuid;

use crate::backend::MigrationBackend;
use crate::db::Database;
use crate::migrations::Migrator;

/// A database for one test.
pub struct TestDatabase {
    db: Database,
    migrations: MigrationsConfig,
}

impl TestDatabase {
    /// Fresh, private in-memory SQLite database.
    pub async fn sqlite_memory() -> Result<Self> {
        Self::from_url("sqlite::memory:").await
    }

    /// Connect to database at the given URL.
    pub async fn from_url(url: &str) -> Result<Self> {
        let config = DatabaseConfig {
            url: url.to_string(),
            pool_size: 4,
            pool_timeout_secs: 5,
            ..Default::default()
        };
        let db = Database::from_config(&config).await?;

        Ok(Self {
            db,
            migrations: test_migrations_config(),
        })
    }

    /// Connect using TEST_DATABASE_URL environment variable.
    ///
    /// Each call uses its own ledger table so parallel tests sharing one
    /// PostgreSQL database do not see each other's ledgers.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("TEST_DATABASE_URL").map_err(|_| {
            KeelError::Database(
                "TEST_DATABASE_URL not set. Set it explicitly for database tests.".to_string(),
            )
        })?;
        let mut test_db = Self::from_url(&url).await?;
        test_db.migrations.table = format!("keel_test_{}", Uuid::new_v4().simple());
        Ok(test_db)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn ledger_table(&self) -> &str {
        &self.migrations.table
    }

    /// A backend over this database with a short lock timeout.
    pub fn backend(&self) -> Result<Arc<dyn MigrationBackend>> {
        self.db.backend(&self.migrations)
    }

    /// A migrator over `migrations`, in the given order.
    pub fn migrator(&self, migrations: Vec<Migration>) -> Result<Migrator> {
        let registry = MigrationRegistry::new(migrations)?;
        Ok(Migrator::new(self.backend()?, Arc::new(registry)))
    }

    /// Run raw SQL to set up test data or schema.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.db.execute(sql).await
    }

    /// Whether a table exists, checked through the database's catalog.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = match &self.db {
            Database::Sqlite(pool) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                )
                .bind(name)
                .fetch_one(pool)
                .await?
            }
            Database::Postgres(pool) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_name = $1",
                )
                .bind(name)
                .fetch_one(pool)
                .await?
            }
        };
        Ok(count > 0)
    }

    /// Drop the ledger and lock tables created by this test.
    pub async fn cleanup(self) -> Result<()> {
        let table = self.migrations.table.clone();
        self.execute(&format!("DROP TABLE IF EXISTS {}", table)).await?;
        self.execute(&format!("DROP TABLE IF EXISTS {}_lock", table))
            .await?;
        self.db.close().await;
        Ok(())
    }
}

fn test_migrations_config() -> MigrationsConfig {
    MigrationsConfig {
        lock_timeout_secs: 1,
        lock_poll_interval_ms: 20,
        ..Default::default()
    }
}
