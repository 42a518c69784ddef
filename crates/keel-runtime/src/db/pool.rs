use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use keel_core::config::{DatabaseConfig, DatabaseKind, MigrationsConfig};
use keel_core::error::{KeelError, Result};

use crate::backend::{LockSettings, MigrationBackend, PostgresBackend, SqliteBackend};

/// Connection pool for the target database.
#[derive(Clone)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Database {
    /// Create a new database connection from configuration.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        match config.kind() {
            Some(DatabaseKind::Postgres) => Self::connect_postgres(config).await,
            Some(DatabaseKind::Sqlite) => Self::connect_sqlite(config).await,
            None => Err(KeelError::Config(format!(
                "Unsupported database URL '{}': expected postgres:// or sqlite:",
                redact_url(&config.url)
            ))),
        }
    }

    async fn connect_postgres(config: &DatabaseConfig) -> Result<Self> {
        let mut options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| KeelError::Config(format!("Invalid database URL: {}", e)))?;
        if config.statement_timeout_secs > 0 {
            options = options.options([(
                "statement_timeout",
                format!("{}s", config.statement_timeout_secs),
            )]);
        }

        // The migration lock pins one connection for the duration of a run
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.max(2))
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| KeelError::Database(format!("Failed to connect to database: {}", e)))?;

        Ok(Self::Postgres(pool))
    }

    async fn connect_sqlite(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| KeelError::Config(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);

        // Every connection to :memory: is a separate database
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs));
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.pool_size.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| KeelError::Database(format!("Failed to open database: {}", e)))?;

        Ok(Self::Sqlite(pool))
    }

    pub fn kind(&self) -> DatabaseKind {
        match self {
            Self::Postgres(_) => DatabaseKind::Postgres,
            Self::Sqlite(_) => DatabaseKind::Sqlite,
        }
    }

    /// Build the migration backend for this database.
    pub fn backend(&self, config: &MigrationsConfig) -> Result<Arc<dyn MigrationBackend>> {
        config.validate()?;
        let lock = LockSettings::from_config(config);

        let backend: Arc<dyn MigrationBackend> = match self {
            Self::Postgres(pool) => {
                Arc::new(PostgresBackend::new(pool.clone(), config.table.clone(), lock))
            }
            Self::Sqlite(pool) => {
                Arc::new(SqliteBackend::new(pool.clone(), config.table.clone(), lock))
            }
        };
        Ok(backend)
    }

    /// Run raw SQL outside the migration engine.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        match self {
            Self::Postgres(pool) => sqlx::query(sql).execute(pool).await.map(|_| ())?,
            Self::Sqlite(pool) => sqlx::query(sql).execute(pool).await.map(|_| ())?,
        }
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        self.execute("SELECT 1")
            .await
            .map_err(|e| KeelError::Database(format!("Health check failed: {}", e)))
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

/// Hide the password in a connection URL for log and error output.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}
