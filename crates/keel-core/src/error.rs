use std::time::Duration;

use thiserror::Error;

/// Core error type for KEEL operations.
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// The ledger table could not be read or written at all.
    #[error("Migration ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// An `up` or `down` statement failed.
    ///
    /// `schema_committed` is true when earlier statements of a
    /// non-transactional migration already took effect, so the schema is
    /// half-changed and has no ledger entry to show for it.
    #[error("Migration '{migration}' failed at statement {statement}: {message}")]
    SchemaChange {
        migration: String,
        statement: usize,
        schema_committed: bool,
        message: String,
    },

    /// The schema statements ran but the ledger could not be updated.
    ///
    /// When `schema_committed` is true the database schema no longer matches
    /// the ledger and must be repaired by hand.
    #[error("Failed to record migration '{migration}' in the ledger (schema committed: {schema_committed}): {message}")]
    LedgerWrite {
        migration: String,
        schema_committed: bool,
        message: String,
    },

    #[error("Migration '{0}' has not been applied")]
    NotApplied(String),

    #[error("Migration '{0}' has already been applied")]
    AlreadyApplied(String),

    #[error("Duplicate migration id: {0}")]
    DuplicateMigrationId(String),

    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    #[error("Migration '{0}' has no down migration")]
    Irreversible(String),

    #[error("Unknown migration: {0}")]
    UnknownMigration(String),

    #[error("Checksum mismatch for applied migration '{migration}': recorded {recorded}, current {current}")]
    ChecksumMismatch {
        migration: String,
        recorded: String,
        current: String,
    },

    #[error("Timed out after {0:?} waiting for the migration lock")]
    LockTimeout(Duration),

    #[error("Migration lock error: {0}")]
    Lock(String),

    /// Stopped before the next migration; `completed` lists the ids applied
    /// (or, for a rollback, reverted) first.
    #[error("Cancelled after completing {} migration(s)", .completed.len())]
    Cancelled { completed: Vec<String> },

    /// A run stopped at `migration`; `completed` lists what it finished before that.
    #[error("Migration run halted at '{migration}': {source}")]
    Halted {
        migration: String,
        completed: Vec<String>,
        #[source]
        source: Box<KeelError>,
    },
}

impl KeelError {
    /// The error that actually stopped the operation, looking through `Halted`.
    pub fn root_cause(&self) -> &KeelError {
        match self {
            KeelError::Halted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the database may be left in a state that an operator has to fix.
    pub fn requires_manual_repair(&self) -> bool {
        match self.root_cause() {
            KeelError::LedgerWrite {
                schema_committed, ..
            }
            | KeelError::SchemaChange {
                schema_committed, ..
            } => *schema_committed,
            KeelError::ChecksumMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias using KeelError.
pub type Result<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_write(schema_committed: bool) -> KeelError {
        KeelError::LedgerWrite {
            migration: "0002_add_email".into(),
            schema_committed,
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_root_cause_unwraps_halted() {
        let err = KeelError::Halted {
            migration: "0002_add_email".into(),
            completed: vec!["0001_create_users".into()],
            source: Box::new(KeelError::NotApplied("x".into())),
        };
        assert!(matches!(err.root_cause(), KeelError::NotApplied(_)));
    }

    #[test]
    fn test_manual_repair_only_when_schema_committed() {
        assert!(ledger_write(true).requires_manual_repair());
        assert!(!ledger_write(false).requires_manual_repair());

        let halted = KeelError::Halted {
            migration: "0002_add_email".into(),
            completed: vec![],
            source: Box::new(ledger_write(true)),
        };
        assert!(halted.requires_manual_repair());

        let schema = KeelError::SchemaChange {
            migration: "0002_add_email".into(),
            statement: 1,
            schema_committed: false,
            message: "syntax error".into(),
        };
        assert!(!schema.requires_manual_repair());

        let partial = KeelError::SchemaChange {
            migration: "0003_concurrent_index".into(),
            statement: 2,
            schema_committed: true,
            message: "syntax error".into(),
        };
        assert!(partial.requires_manual_repair());
    }

    #[test]
    fn test_display_messages() {
        let err = KeelError::Cancelled {
            completed: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Cancelled after completing 2 migration(s)");
        assert_eq!(
            KeelError::NotApplied("0001".into()).to_string(),
            "Migration '0001' has not been applied"
        );
    }
}
