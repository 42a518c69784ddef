use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::{debug, warn};

use keel_core::config::KeelConfig;
use keel_core::error::KeelError;
use keel_core::migration::{AppliedMigration, MigrationStatus};
use keel_runtime::db::redact_url;
use keel_runtime::{load_registry, Database, Migrator, UnlockOutcome};
use tokio::task::JoinHandle;

/// Roll back the last N migrations.
#[derive(Parser)]
pub struct DownCommand {
    /// Number of migrations to roll back.
    #[arg(default_value = "1")]
    pub count: usize,
}

/// Show migration status.
#[derive(Parser)]
pub struct StatusCommand {
    /// Print the status as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Open the database and build a migrator over the configured directory.
async fn connect(config: &KeelConfig) -> Result<(Database, Migrator)> {
    let registry = load_registry(Path::new(&config.migrations.dir), Vec::new())?;

    debug!(
        url = %redact_url(&config.database.url),
        migrations = registry.len(),
        "Connecting"
    );
    let db = Database::from_config(&config.database).await?;
    let backend = db.backend(&config.migrations)?;
    let migrator = Migrator::new(backend, Arc::new(registry))
        .verify_checksums(config.migrations.verify_checksums);

    Ok((db, migrator))
}

/// Cancel the migrator's token on Ctrl-C. The work in flight finishes and
/// nothing after it starts.
fn cancel_on_interrupt(migrator: &Migrator) -> JoinHandle<()> {
    let token = migrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current migration");
            token.cancel();
        }
    })
}

fn print_header(title: &str) {
    println!();
    println!(
        "  {}  {} {}",
        style("⚓").bold(),
        style("KEEL").bold().cyan(),
        title
    );
    println!();
}

/// `keel up`
pub async fn up(config: &KeelConfig) -> Result<()> {
    print_header("Migrations");

    let (db, migrator) = connect(config).await?;
    if migrator.registry().is_empty() {
        println!(
            "  {} No migrations found in {}",
            style("ℹ").blue(),
            config.migrations.dir
        );
        db.close().await;
        return Ok(());
    }

    let interrupt = cancel_on_interrupt(&migrator);
    println!("  {} Running pending migrations...", style("→").dim());
    let result = migrator.run_migrations().await;
    interrupt.abort();
    db.close().await;

    match result {
        Ok(report) => {
            for entry in &report.applied {
                print_applied(entry);
            }
            if report.is_noop() {
                println!("  {} Database is up to date", style("✓").green());
            } else {
                println!();
                println!(
                    "  {} Applied {} migration(s), {} already applied",
                    style("✓").green(),
                    report.applied.len(),
                    report.skipped.len()
                );
            }
            println!();
            Ok(())
        }
        Err(e) => {
            print_failure(&e);
            Err(e.into())
        }
    }
}

impl DownCommand {
    /// `keel down [count]`
    pub async fn execute(&self, config: &KeelConfig) -> Result<()> {
        print_header("Migrations");

        if self.count == 0 {
            println!("  {} Nothing to rollback (count=0)", style("ℹ").blue());
            return Ok(());
        }

        let (db, migrator) = connect(config).await?;
        println!(
            "  {} Rolling back {} migration(s)...",
            style("→").dim(),
            self.count
        );

        let interrupt = cancel_on_interrupt(&migrator);
        let result = migrator.rollback_last(self.count).await;
        interrupt.abort();
        db.close().await;

        match result {
            Ok(rolled_back) if rolled_back.is_empty() => {
                println!("  {} No migrations to rollback", style("ℹ").blue());
            }
            Ok(rolled_back) => {
                for id in &rolled_back {
                    println!("  {} Rolled back: {}", style("✓").green(), id);
                }
                println!();
                println!(
                    "  {} Rolled back {} migration(s)",
                    style("✓").green(),
                    rolled_back.len()
                );
            }
            Err(e) => {
                print_failure(&e);
                return Err(e.into());
            }
        }
        println!();
        Ok(())
    }
}

impl StatusCommand {
    /// `keel status [--json]`
    pub async fn execute(&self, config: &KeelConfig) -> Result<()> {
        let (db, migrator) = connect(config).await?;
        let status = migrator.status().await;
        db.close().await;
        let status = status?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        print_header("Migration Status");
        print_status(&migrator, &status);
        Ok(())
    }
}

fn print_status(migrator: &Migrator, status: &MigrationStatus) {
    if status.applied.is_empty() && status.pending.is_empty() && status.unknown.is_empty() {
        println!("  {} No migrations found", style("ℹ").blue());
        println!();
        return;
    }

    if !status.applied.is_empty() {
        println!("  {} Applied:", style("✓").green());
        for entry in &status.applied {
            let reversible = migrator
                .registry()
                .get(&entry.id)
                .is_some_and(|m| m.is_reversible());
            let down_marker = if reversible {
                style("↓").green().to_string()
            } else {
                style("-").dim().to_string()
            };
            println!(
                "    {} {} {} ({})",
                down_marker,
                style(&entry.id).cyan(),
                style("at").dim(),
                entry.applied_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    if !status.pending.is_empty() {
        if !status.applied.is_empty() {
            println!();
        }
        println!("  {} Pending:", style("○").yellow());
        for id in &status.pending {
            println!("    {} {}", style("→").dim(), style(id).yellow());
        }
    }

    if !status.unknown.is_empty() {
        println!();
        println!("  {} Not in migrations directory:", style("?").red());
        for entry in &status.unknown {
            println!(
                "    {} {} {} ({})",
                style("?").red(),
                style(&entry.id).red(),
                style("at").dim(),
                entry.applied_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    println!();
    println!(
        "  {} {} applied, {} pending, {} unknown",
        style("ℹ").blue(),
        status.applied.len(),
        status.pending.len(),
        status.unknown.len()
    );
    println!();

    // Legend
    println!(
        "  {} = has down migration, {} = no down migration",
        style("↓").green(),
        style("-").dim()
    );
    println!();
}

/// `keel unlock`
pub async fn unlock(config: &KeelConfig) -> Result<()> {
    print_header("Migrations");

    let (db, migrator) = connect(config).await?;
    let outcome = migrator.force_unlock().await;
    db.close().await;

    match outcome? {
        UnlockOutcome::NotHeld => {
            println!("  {} No migration lock was held", style("ℹ").blue());
        }
        UnlockOutcome::Cleared {
            holder,
            acquired_at,
        } => {
            println!(
                "  {} Cleared migration lock held by {} since {}",
                style("✓").green(),
                style(holder).cyan(),
                acquired_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        UnlockOutcome::HeldBySessions(pids) => {
            let pids: Vec<String> = pids.iter().map(|pid| pid.to_string()).collect();
            println!(
                "  {} Migration lock is held by PostgreSQL session(s) {}",
                style("!").yellow(),
                pids.join(", ")
            );
            println!("    The advisory lock ends with its session. It was not cleared.");
            println!("    Stop that process, or end it with pg_terminate_backend(<pid>).");
        }
    }
    println!();
    Ok(())
}

fn print_applied(entry: &AppliedMigration) {
    println!(
        "  {} Applied: {} {}",
        style("✓").green(),
        entry.id,
        style(format!("({} ms)", entry.execution_time_ms)).dim()
    );
}

fn print_failure(err: &KeelError) {
    println!();
    match err {
        KeelError::Halted {
            migration,
            completed,
            ..
        } => {
            for id in completed {
                println!("  {} Done: {}", style("✓").green(), id);
            }
            println!("  {} Failed: {}", style("✗").red(), migration);
            println!("    {}", err.root_cause());
            if !completed.is_empty() {
                println!();
                println!(
                    "  {} The database is partially migrated: {} migration(s) above \
                     were completed before the failure.",
                    style("!").yellow(),
                    completed.len()
                );
            }
        }
        KeelError::Cancelled { completed } => {
            for id in completed {
                println!("  {} Done: {}", style("✓").green(), id);
            }
            println!("  {} Cancelled before the next migration", style("!").yellow());
        }
        other => println!("  {} {}", style("✗").red(), other),
    }

    if err.requires_manual_repair() {
        println!();
        println!(
            "  {} Manual intervention required: the schema and the migration ledger disagree.",
            style("⚠").red().bold()
        );
        println!(
            "    Inspect the database and fix the ledger table before running `keel up` again."
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_runtime::MigrationBackend;
    use std::fs;
    use tempfile::TempDir;

    fn project() -> (TempDir, KeelConfig) {
        let dir = TempDir::new().unwrap();
        let migrations = dir.path().join("migrations");
        fs::create_dir_all(&migrations).unwrap();
        fs::write(
            migrations.join("0001_create_users.sql"),
            "-- @up\nCREATE TABLE users (id INTEGER PRIMARY KEY);\n-- @down\nDROP TABLE users;\n",
        )
        .unwrap();
        fs::write(
            migrations.join("0002_create_posts.sql"),
            "-- @up\nCREATE TABLE posts (id INTEGER PRIMARY KEY);\n-- @down\nDROP TABLE posts;\n",
        )
        .unwrap();

        let url = format!("sqlite://{}", dir.path().join("app.db").display());
        let mut config = KeelConfig::default_with_database_url(&url);
        config.migrations.dir = migrations.display().to_string();
        config.migrations.lock_timeout_secs = 1;
        (dir, config)
    }

    async fn status_of(config: &KeelConfig) -> MigrationStatus {
        let (db, migrator) = connect(config).await.unwrap();
        let status = migrator.status().await.unwrap();
        db.close().await;
        status
    }

    #[tokio::test]
    async fn test_up_down_status() {
        let (_dir, config) = project();

        up(&config).await.unwrap();
        let status = status_of(&config).await;
        assert_eq!(status.applied.len(), 2);
        assert!(status.is_up_to_date());

        // Second run is a no-op
        up(&config).await.unwrap();

        DownCommand { count: 1 }.execute(&config).await.unwrap();
        let status = status_of(&config).await;
        assert_eq!(status.pending, vec!["0002_create_posts"]);

        StatusCommand { json: true }.execute(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_up_reports_halt() {
        let (dir, config) = project();
        fs::write(
            dir.path().join("migrations").join("0003_broken.sql"),
            "INSERT INTO missing_table VALUES (1);",
        )
        .unwrap();

        let err = up(&config).await.unwrap_err();
        let err = err.downcast::<KeelError>().unwrap();
        assert!(matches!(err, KeelError::Halted { ref completed, .. } if completed.len() == 2));
        assert!(!err.requires_manual_repair());
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let (_dir, config) = project();
        unlock(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_clears_crashed_holder() {
        let (_dir, config) = project();
        let (db, _) = connect(&config).await.unwrap();
        let crashed = db.backend(&config.migrations).unwrap();
        crashed.acquire_lock().await.unwrap();
        db.close().await;

        unlock(&config).await.unwrap();

        // The lock is free again
        up(&config).await.unwrap();
        assert!(status_of(&config).await.is_up_to_date());
    }
}
