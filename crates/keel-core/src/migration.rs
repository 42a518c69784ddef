use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{KeelError, Result};

/// A single hand-authored schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Ledger key (e.g. "0001_create_users"). Never renamed once shipped.
    pub id: String,
    /// Human-readable summary.
    pub description: String,
    /// Forward SQL.
    pub up: String,
    /// Reverse SQL. `None` when the migration cannot be rolled back.
    pub down: Option<String>,
    /// Run the statements and the ledger write in a single transaction.
    pub transactional: bool,
}

impl Migration {
    pub fn new(id: impl Into<String>, up: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            description: describe_id(&id),
            id,
            up: up.into(),
            down: None,
            transactional: true,
        }
    }

    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Run outside a transaction, for statements PostgreSQL refuses to run
    /// inside one (`CREATE INDEX CONCURRENTLY`, `ALTER TYPE ... ADD VALUE`).
    pub fn without_transaction(mut self) -> Self {
        self.transactional = false;
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    /// Hex SHA-256 of the forward SQL, stored in the ledger.
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.up.as_bytes()))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(KeelError::InvalidMigration(
                "migration id must not be empty".into(),
            ));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(KeelError::InvalidMigration(format!(
                "migration id '{}' must not contain whitespace",
                self.id
            )));
        }
        if self.up.trim().is_empty() {
            return Err(KeelError::InvalidMigration(format!(
                "migration '{}' has an empty up section",
                self.id
            )));
        }
        Ok(())
    }
}

/// Derive a description from an id: "0001_create_users" -> "create users".
pub fn describe_id(id: &str) -> String {
    let rest = id.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = rest.trim_start_matches(['_', '-']);
    let rest = if rest.is_empty() { id } else { rest };
    rest.replace(['_', '-'], " ")
}

/// A ledger entry for a migration that has been applied.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub id: String,
    pub description: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Migrations applied by this run, in order.
    pub applied: Vec<AppliedMigration>,
    /// Migrations that were already in the ledger.
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn applied_ids(&self) -> Vec<String> {
        self.applied.iter().map(|m| m.id.clone()).collect()
    }
}

/// Comparison of the registry against the ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStatus {
    /// Ledger entries for registered migrations, in registry order.
    pub applied: Vec<AppliedMigration>,
    /// Registered migrations not yet in the ledger, in registry order.
    pub pending: Vec<String>,
    /// Ledger entries whose id is not in the registry.
    pub unknown: Vec<AppliedMigration>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_new() {
        let m = Migration::new("0001_create_users", "CREATE TABLE users (id INT)");
        assert_eq!(m.id, "0001_create_users");
        assert_eq!(m.description, "create users");
        assert!(m.transactional);
        assert!(!m.is_reversible());
    }

    #[test]
    fn test_builder_methods() {
        let m = Migration::new("0002_idx", "CREATE INDEX CONCURRENTLY i ON t (c)")
            .with_down("DROP INDEX i")
            .with_description("index c")
            .without_transaction();
        assert_eq!(m.down.as_deref(), Some("DROP INDEX i"));
        assert_eq!(m.description, "index c");
        assert!(!m.transactional);
    }

    #[test]
    fn test_checksum_tracks_up_sql() {
        let a = Migration::new("a", "CREATE TABLE users (id UUID)");
        let b = Migration::new("b", "CREATE TABLE users (id UUID)").with_down("DROP TABLE users");
        let c = Migration::new("a", "CREATE TABLE posts (id UUID)");

        assert_eq!(a.checksum().len(), 64);
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_describe_id() {
        assert_eq!(describe_id("0001_create_users"), "create users");
        assert_eq!(describe_id("add-posts"), "add posts");
        assert_eq!(describe_id("0003"), "0003");
    }

    #[test]
    fn test_validate() {
        assert!(Migration::new("0001_ok", "SELECT 1").validate().is_ok());
        assert!(Migration::new("", "SELECT 1").validate().is_err());
        assert!(Migration::new("has space", "SELECT 1").validate().is_err());
        assert!(Migration::new("0001_empty", "  ").validate().is_err());
    }
}
