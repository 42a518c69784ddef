mod loader;
mod migrator;
mod sql;

pub use loader::{
    load_migrations_from_dir, load_registry, migration_template, next_migration_filename,
    parse_migration,
};
pub use migrator::Migrator;
pub use sql::split_sql_statements;
