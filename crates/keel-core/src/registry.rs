//! Ordered, immutable set of known migrations.

use std::collections::HashMap;

use crate::error::{KeelError, Result};
use crate::migration::Migration;

/// Registry of every migration the application ships.
///
/// Order is authoring order as supplied, not sorted by id. Built once at
/// startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
    index: HashMap<String, usize>,
}

impl MigrationRegistry {
    /// Build a registry, rejecting invalid migrations and duplicate ids.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        let mut index = HashMap::with_capacity(migrations.len());

        for (position, migration) in migrations.iter().enumerate() {
            migration.validate()?;
            if index.insert(migration.id.clone(), position).is_some() {
                return Err(KeelError::DuplicateMigrationId(migration.id.clone()));
            }
        }

        Ok(Self { migrations, index })
    }

    pub fn get(&self, id: &str) -> Option<&Migration> {
        self.index.get(id).map(|&i| &self.migrations[i])
    }

    /// Position of `id` in registry order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: &str) -> Migration {
        Migration::new(id, "SELECT 1")
    }

    #[test]
    fn test_empty_registry() {
        let registry = MigrationRegistry::new(vec![]).unwrap();
        assert!(registry.is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn test_preserves_authoring_order() {
        let registry =
            MigrationRegistry::new(vec![m("b_second"), m("a_first"), m("c_third")]).unwrap();
        assert_eq!(registry.ids(), vec!["b_second", "a_first", "c_third"]);
        assert_eq!(registry.position("a_first"), Some(1));
        assert!(registry.contains("c_third"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = MigrationRegistry::new(vec![m("0001_a"), m("0002_b"), m("0001_a")]).unwrap_err();
        match err {
            KeelError::DuplicateMigrationId(id) => assert_eq!(id, "0001_a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_migration_rejected() {
        let err = MigrationRegistry::new(vec![m("0001_a"), m("")]).unwrap_err();
        assert!(matches!(err, KeelError::InvalidMigration(_)));
    }

    #[test]
    fn test_get_returns_migration() {
        let users = Migration::new("0001_users", "CREATE TABLE users (id INT)");
        let registry = MigrationRegistry::new(vec![users]).unwrap();
        let found = registry.get("0001_users").unwrap();
        assert_eq!(found.up, "CREATE TABLE users (id INT)");
    }
}
