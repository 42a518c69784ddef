mod logging;
mod migrate;
mod new;

pub use migrate::{DownCommand, StatusCommand};
pub use new::NewCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_core::config::{KeelConfig, LoggingConfig};

/// KEEL - versioned schema migrations
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path.
    #[arg(short, long, default_value = "keel.toml", global = true)]
    pub config: String,

    /// Migrations directory (overrides the config file).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<String>,

    /// Database URL (overrides the config file and DATABASE_URL).
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Apply all pending migrations.
    Up,

    /// Roll back the most recently applied migrations.
    Down(DownCommand),

    /// Show applied, pending and unknown migrations.
    Status(StatusCommand),

    /// Create a new migration file.
    New(NewCommand),

    /// Clear a migration lock left behind by a crashed process.
    Unlock,
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        // Load .env if present
        dotenvy::dotenv().ok();

        match &self.command {
            Commands::New(cmd) => {
                logging::init(&LoggingConfig::default(), self.verbose);
                cmd.execute(&self.migrations_dir_for_new()?)
            }
            Commands::Up => migrate::up(&self.setup()?).await,
            Commands::Down(cmd) => cmd.execute(&self.setup()?).await,
            Commands::Status(cmd) => cmd.execute(&self.setup()?).await,
            Commands::Unlock => migrate::unlock(&self.setup()?).await,
        }
    }

    /// Load configuration and install logging for a database command.
    fn setup(&self) -> Result<KeelConfig> {
        let config = self.load_config()?;
        logging::init(&config.logging, self.verbose);
        Ok(config)
    }

    /// Resolve configuration from the config file and command-line overrides.
    ///
    /// Without a config file the database URL must come from
    /// `--database-url` or `DATABASE_URL`.
    fn load_config(&self) -> Result<KeelConfig> {
        let url_override = self
            .database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok());

        let config_path = Path::new(&self.config);
        let mut config = if config_path.exists() {
            let mut config = KeelConfig::from_file(config_path)?;
            if let Some(url) = &self.database_url {
                config.database.url = url.clone();
            }
            config
        } else if let Some(url) = url_override {
            KeelConfig::default_with_database_url(&url)
        } else {
            anyhow::bail!(
                "Configuration file not found: {}\nCreate it or pass --database-url.",
                self.config
            );
        };

        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.clone();
        }
        Ok(config)
    }

    fn migrations_dir_for_new(&self) -> Result<String> {
        if let Some(dir) = &self.migrations_dir {
            return Ok(dir.clone());
        }
        let config_path = Path::new(&self.config);
        if config_path.exists() {
            return Ok(KeelConfig::from_file(config_path)?.migrations.dir);
        }
        Ok(keel_core::config::MigrationsConfig::default().dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parse_up() {
        let cli = Cli::try_parse_from(["keel", "up"]).unwrap();
        assert!(matches!(cli.command, Commands::Up));
        assert_eq!(cli.config, "keel.toml");
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parse_down_defaults_to_one() {
        let cli = Cli::try_parse_from(["keel", "down"]).unwrap();
        match cli.command {
            Commands::Down(cmd) => assert_eq!(cmd.count, 1),
            _ => panic!("expected down"),
        }

        let cli = Cli::try_parse_from(["keel", "down", "3"]).unwrap();
        match cli.command {
            Commands::Down(cmd) => assert_eq!(cmd.count, 3),
            _ => panic!("expected down"),
        }
    }

    #[test]
    fn test_cli_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "keel",
            "status",
            "--json",
            "--database-url",
            "sqlite::memory:",
            "-m",
            "db/migrations",
            "-v",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Status(ref cmd) if cmd.json));
        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(cli.migrations_dir.as_deref(), Some("db/migrations"));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_parse_new_requires_name() {
        assert!(Cli::try_parse_from(["keel", "new"]).is_err());
        assert!(Cli::try_parse_from(["keel", "new", "create_users"]).is_ok());
    }

    #[test]
    fn test_load_config_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keel.toml");
        fs::write(
            &path,
            r#"
            [database]
            url = "sqlite://from-file.db"

            [migrations]
            table = "schema_history"
            "#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "keel",
            "up",
            "--config",
            path.to_str().unwrap(),
            "--database-url",
            "sqlite::memory:",
            "--migrations-dir",
            "sql",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.migrations.dir, "sql");
        assert_eq!(config.migrations.table, "schema_history");
    }

    #[test]
    fn test_load_config_without_file_uses_database_url() {
        let cli = Cli::try_parse_from([
            "keel",
            "up",
            "--config",
            "/nonexistent/keel.toml",
            "--database-url",
            "sqlite::memory:",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.migrations.dir, "migrations");
    }
}
