//! Loading migrations from `*.sql` files.
//!
//! A migration file holds the forward SQL, optionally followed by the reverse
//! SQL after a `-- @down` line:
//!
//! ```sql
//! -- @description create the users table
//! -- @up
//! CREATE TABLE users (id BIGINT PRIMARY KEY, name TEXT NOT NULL);
//!
//! -- @down
//! DROP TABLE users;
//! ```
//!
//! `-- @no-transaction` runs the migration outside a transaction.

use std::path::Path;

use keel_core::error::{KeelError, Result};
use keel_core::migration::Migration;
use keel_core::registry::MigrationRegistry;
use tracing::debug;

use super::sql::split_sql_statements;

#[derive(PartialEq)]
enum Section {
    Up,
    Down,
}

/// Parse the contents of one migration file.
pub fn parse_migration(id: &str, content: &str) -> Result<Migration> {
    let mut up = String::new();
    let mut down = String::new();
    let mut description = None;
    let mut transactional = true;
    let mut section = Section::Up;
    let mut seen_down = false;

    for line in content.lines() {
        let Some(directive) = parse_directive(line) else {
            let body = match section {
                Section::Up => &mut up,
                Section::Down => &mut down,
            };
            body.push_str(line);
            body.push('\n');
            continue;
        };

        let (name, arg) = directive
            .split_once(char::is_whitespace)
            .map(|(n, a)| (n, a.trim()))
            .unwrap_or((directive, ""));

        match name {
            "up" => {
                if seen_down {
                    return Err(KeelError::InvalidMigration(format!(
                        "{}: @up must come before @down",
                        id
                    )));
                }
            }
            "down" => {
                if seen_down {
                    return Err(KeelError::InvalidMigration(format!(
                        "{}: more than one @down section",
                        id
                    )));
                }
                seen_down = true;
                section = Section::Down;
            }
            "description" => description = Some(arg.to_string()),
            "no-transaction" => transactional = false,
            other => {
                return Err(KeelError::InvalidMigration(format!(
                    "{}: unknown directive @{}",
                    id, other
                )))
            }
        }
    }

    let mut migration = Migration::new(id, up.trim());
    if let Some(description) = description.filter(|d| !d.is_empty()) {
        migration = migration.with_description(description);
    }
    // A @down section with no statements is treated as irreversible
    if !split_sql_statements(&down).is_empty() {
        migration = migration.with_down(down.trim());
    }
    if !transactional {
        migration = migration.without_transaction();
    }

    if split_sql_statements(&migration.up).is_empty() {
        return Err(KeelError::InvalidMigration(format!(
            "{}: no statements in the up section",
            id
        )));
    }

    Ok(migration)
}

/// `-- @name args` on its own line.
fn parse_directive(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("--")?
        .trim_start()
        .strip_prefix('@')
        .map(str::trim)
}

/// Load migrations from a directory.
///
/// Migrations should be named like:
/// - `0001_create_users.sql`
/// - `0002_add_posts.sql`
///
/// They are sorted by file name and executed in that order. A missing
/// directory yields no migrations.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_file() && path.extension().map(|e| e == "sql").unwrap_or(false) {
            files.push(path);
        }
    }

    files.sort();

    let mut migrations = Vec::with_capacity(files.len());
    for path in files {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| KeelError::Config(format!("Invalid migration filename: {:?}", path)))?;

        let content = std::fs::read_to_string(&path)?;
        migrations.push(parse_migration(id, &content)?);
    }

    debug!("Loaded {} migrations from {:?}", migrations.len(), dir);
    Ok(migrations)
}

/// Build a registry from a directory followed by programmatic migrations.
pub fn load_registry(dir: &Path, extra: Vec<Migration>) -> Result<MigrationRegistry> {
    let mut migrations = load_migrations_from_dir(dir)?;
    migrations.extend(extra);
    MigrationRegistry::new(migrations)
}

/// Next file name for a new migration, e.g. `0004_add_index.sql`.
pub fn next_migration_filename(dir: &Path, name: &str) -> Result<String> {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        return Err(KeelError::InvalidMigration(format!(
            "'{}' is not a usable migration name",
            name
        )));
    }

    // File names only: a freshly generated skeleton does not parse yet
    let mut highest = 0;
    if dir.exists() {
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let digits: String = name
                .to_string_lossy()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse::<u32>() {
                highest = highest.max(n);
            }
        }
    }
    let next = highest + 1;

    Ok(format!("{:04}_{}.sql", next, slug))
}

/// Skeleton written by `keel new`.
pub fn migration_template(description: &str) -> String {
    format!(
        "-- @description {}\n-- @up\n\n\n-- @down\n\n",
        description
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_migrations_from_empty_dir() {
        let dir = TempDir::new().unwrap();
        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_from_nonexistent_dir() {
        let migrations = load_migrations_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_load_migrations_sorted() {
        let dir = TempDir::new().unwrap();

        // Create migrations out of order
        fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("0003_third.sql"), "SELECT 3;").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(migrations.len(), 3);
        assert_eq!(migrations[0].id, "0001_first");
        assert_eq!(migrations[1].id, "0002_second");
        assert_eq!(migrations[2].id, "0003_third");
    }

    #[test]
    fn test_load_migrations_ignores_non_sql() {
        let dir = TempDir::new().unwrap();

        fs::write(dir.path().join("0001_migration.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("readme.txt"), "Not a migration").unwrap();
        fs::write(dir.path().join("backup.sql.bak"), "Backup").unwrap();

        let migrations = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].id, "0001_migration");
    }

    #[test]
    fn test_parse_up_and_down() {
        let content = r#"
-- @description create the users table
-- @up
CREATE TABLE users (id BIGINT PRIMARY KEY);

-- @down
DROP TABLE users;
"#;
        let m = parse_migration("0001_create_users", content).unwrap();
        assert_eq!(m.description, "create the users table");
        assert_eq!(m.up, "CREATE TABLE users (id BIGINT PRIMARY KEY);");
        assert_eq!(m.down.as_deref(), Some("DROP TABLE users;"));
        assert!(m.transactional);
    }

    #[test]
    fn test_parse_without_markers() {
        let m = parse_migration("0001_create_users", "CREATE TABLE users (id INT);").unwrap();
        assert_eq!(m.description, "create users");
        assert!(m.down.is_none());
    }

    #[test]
    fn test_parse_no_transaction() {
        let content = "-- @no-transaction\n\
                       CREATE INDEX CONCURRENTLY idx ON users (name);\n\
                       -- @down\n\
                       DROP INDEX CONCURRENTLY idx;";
        let m = parse_migration("0002_index", content).unwrap();
        assert!(!m.transactional);
        assert!(m.is_reversible());
    }

    #[test]
    fn test_empty_down_is_irreversible() {
        let content = "UPDATE users SET name = lower(name);\n-- @down\n-- nothing to undo\n";
        let m = parse_migration("0003_lowercase", content).unwrap();
        assert!(!m.is_reversible());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_migration("x", "SELECT 1;\n-- @dwon\nSELECT 2;"),
            Err(KeelError::InvalidMigration(_))
        ));
        assert!(parse_migration("x", "SELECT 1;\n-- @down\nA;\n-- @down\nB;").is_err());
        assert!(parse_migration("x", "SELECT 1;\n-- @down\nA;\n-- @up\nB;").is_err());
        assert!(parse_migration("x", "-- only a comment\n-- @down\nDROP TABLE t;").is_err());
    }

    #[test]
    fn test_plain_comments_are_kept() {
        let m = parse_migration("x", "-- regular comment\nSELECT 1;").unwrap();
        assert!(m.up.starts_with("-- regular comment"));
    }

    #[test]
    fn test_load_registry_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();

        let err = load_registry(dir.path(), vec![Migration::new("0001_first", "SELECT 2")])
            .unwrap_err();
        assert!(matches!(err, KeelError::DuplicateMigrationId(_)));
    }

    #[test]
    fn test_next_migration_filename() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            next_migration_filename(dir.path(), "Create Users").unwrap(),
            "0001_create_users.sql"
        );

        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("0007_seventh.sql"), "SELECT 7;").unwrap();
        assert_eq!(
            next_migration_filename(dir.path(), "add-index").unwrap(),
            "0008_add_index.sql"
        );
        assert!(next_migration_filename(dir.path(), "  !! ").is_err());

        // An unfilled skeleton still counts
        fs::write(dir.path().join("0008_add_index.sql"), migration_template("add index")).unwrap();
        assert_eq!(
            next_migration_filename(dir.path(), "next").unwrap(),
            "0009_next.sql"
        );
    }

    #[test]
    fn test_template_parses_back() {
        let template = migration_template("add posts");
        let content = template.replace("-- @up\n", "-- @up\nCREATE TABLE posts (id INT);\n");
        let m = parse_migration("0002_add_posts", &content).unwrap();
        assert_eq!(m.description, "add posts");
        assert!(!m.is_reversible());
    }
}
