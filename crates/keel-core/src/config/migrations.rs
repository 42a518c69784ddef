use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Migration engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `*.sql` migration files.
    #[serde(default = "default_dir")]
    pub dir: String,

    /// Ledger table name.
    #[serde(default = "default_table")]
    pub table: String,

    /// How long to wait for another process to release the migration lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Delay between lock attempts in milliseconds.
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,

    /// Refuse to run when an applied migration's SQL has changed.
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            table: default_table(),
            lock_timeout_secs: default_lock_timeout(),
            lock_poll_interval_ms: default_lock_poll_interval(),
            verify_checksums: true,
        }
    }
}

impl MigrationsConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.max(1))
    }

    /// The ledger table name is interpolated into SQL, so only plain
    /// identifiers are accepted.
    pub fn validate(&self) -> Result<()> {
        let re = regex_lite::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
            .map_err(|e| KeelError::Config(e.to_string()))?;
        if !re.is_match(&self.table) {
            return Err(KeelError::Config(format!(
                "Invalid ledger table name '{}'",
                self.table
            )));
        }
        Ok(())
    }
}

fn default_dir() -> String {
    "migrations".to_string()
}

fn default_table() -> String {
    "keel_migrations".to_string()
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_lock_poll_interval() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrationsConfig::default();
        assert_eq!(config.dir, "migrations");
        assert_eq!(config.table, "keel_migrations");
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert!(config.verify_checksums);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let config = MigrationsConfig {
            table: "ledger; DROP TABLE users".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(KeelError::Config(_))));

        let config = MigrationsConfig {
            table: "1ledger".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = MigrationsConfig {
            lock_poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(1));
    }
}
