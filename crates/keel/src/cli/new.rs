use anyhow::Result;
use clap::Parser;
use console::style;
use std::fs;
use std::path::Path;

use keel_core::migration::describe_id;
use keel_runtime::migrations::{migration_template, next_migration_filename};

/// Create a new migration file.
#[derive(Parser)]
pub struct NewCommand {
    /// Migration name, e.g. "create users".
    pub name: String,
}

impl NewCommand {
    /// Write the next numbered migration skeleton into `dir`.
    pub fn execute(&self, dir: &str) -> Result<()> {
        let path = create_migration(Path::new(dir), &self.name)?;

        println!();
        println!(
            "  {} Created migration: {}",
            style("✓").green(),
            style(path.display()).cyan()
        );
        println!("  {} Fill in the -- @up and -- @down sections", style("→").dim());
        println!();
        Ok(())
    }
}

/// Create `dir` if needed and write a new migration skeleton into it.
pub fn create_migration(dir: &Path, name: &str) -> Result<std::path::PathBuf> {
    fs::create_dir_all(dir)?;

    let filename = next_migration_filename(dir, name)?;
    let path = dir.join(&filename);
    if path.exists() {
        anyhow::bail!("Migration already exists: {}", path.display());
    }

    let id = filename.trim_end_matches(".sql");
    fs::write(&path, migration_template(&describe_id(id)))?;
    tracing::debug!(path = %path.display(), "Migration created");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_migration_numbers_sequentially() {
        let dir = TempDir::new().unwrap();
        let migrations = dir.path().join("migrations");

        let first = create_migration(&migrations, "create users").unwrap();
        assert_eq!(first.file_name().unwrap(), "0001_create_users.sql");

        let second = create_migration(&migrations, "Add Email").unwrap();
        assert_eq!(second.file_name().unwrap(), "0002_add_email.sql");

        let content = fs::read_to_string(&second).unwrap();
        assert!(content.contains("-- @description add email"));
        assert!(content.contains("-- @up"));
        assert!(content.contains("-- @down"));
    }

    #[test]
    fn test_create_migration_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        assert!(create_migration(dir.path(), "???").is_err());
    }
}
