pub mod config;
pub mod error;
pub mod migration;
pub mod registry;

pub use config::KeelConfig;
pub use error::{KeelError, Result};
pub use migration::{AppliedMigration, Migration, MigrationStatus, RunReport};
pub use registry::MigrationRegistry;
