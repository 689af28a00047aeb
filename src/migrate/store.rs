//! Migration step storage: SQL files on disk plus the history table.
//!
//! A step is a file named `NNN_name.sql` where `NNN` is a fixed-width,
//! zero-padded sequence number. An optional `NNN_name.down.sql` alongside it
//! holds the explicit inverse used by rollback. Applied steps are recorded in
//! the `migration_history` table; the sequence prefix makes lexicographic
//! name order the application order, so no separate id column is needed.

use crate::conn::manager::ConnectionManager;
use crate::conn::registry::ScopeId;
use crate::conn::url::DatabaseType;
use crate::error::{DbError, DbResult};
use crate::migrate::migrator::SchemaMigrator;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the history table inside the managed database.
pub const HISTORY_TABLE: &str = "migration_history";

/// Width of the zero-padded sequence prefix. The fixed width caps the store
/// at [`MAX_STEPS`] steps; merge collapses a full store back to one.
const SEQUENCE_WIDTH: usize = 3;

/// Highest number of steps the fixed-width prefix can express.
const MAX_STEPS: usize = 1000;

const STEP_TEMPLATE: &str = "-- Schema changes for this step. Statements run in order inside one\n\
                             -- transaction; a failure rolls back the whole step.\n";

pub struct MigrationStore {
    path: PathBuf,
    db_type: DatabaseType,
}

impl MigrationStore {
    pub fn new(path: impl Into<PathBuf>, db_type: DatabaseType) -> Self {
        Self {
            path: path.into(),
            db_type,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List step names in ascending sequence order, creating the directory
    /// if it does not exist yet (an empty directory means no steps, not an
    /// error).
    pub fn scan(&self) -> DbResult<Vec<String>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "Creating migrations directory");
            fs::create_dir_all(&self.path)?;
        }

        let mut steps = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(step) = step_name(name) {
                steps.push(step.to_string());
            }
        }
        steps.sort();
        Ok(steps)
    }

    /// Create a new empty step file, allocating the next sequence number.
    /// Returns the generated step name (`NNN_name`).
    pub fn create(&self, name: &str) -> DbResult<String> {
        self.create_with_body(name, STEP_TEMPLATE)
    }

    /// Create a new step file with the rendered statements of an accumulated
    /// schema batch.
    pub fn create_from_ops(&self, name: &str, migrator: &SchemaMigrator) -> DbResult<String> {
        let mut body = String::from(STEP_TEMPLATE);
        for statement in migrator.to_sql()? {
            body.push_str(&statement);
            body.push_str(";\n");
        }
        self.create_with_body(name, &body)
    }

    pub fn create_with_body(&self, name: &str, body: &str) -> DbResult<String> {
        validate_name(name)?;
        let existing = self.scan()?;
        // A wider sequence would be invisible to the step-name matcher.
        if existing.len() >= MAX_STEPS {
            return Err(DbError::invalid_input(format!(
                "Migration sequence exhausted: the {}-digit prefix allows at most {} steps; \
                 merge the existing steps first",
                SEQUENCE_WIDTH, MAX_STEPS
            )));
        }
        let step = format!("{:0width$}_{}", existing.len(), name, width = SEQUENCE_WIDTH);
        let file = self.path.join(format!("{}.sql", step));
        fs::write(&file, body)?;
        info!(step = %step, path = %file.display(), "Created migration");
        Ok(step)
    }

    /// Read a step's SQL body.
    pub fn read_step(&self, step: &str) -> DbResult<String> {
        let file = self.path.join(format!("{}.sql", step));
        fs::read_to_string(&file)
            .map_err(|e| DbError::migration(step, format!("Cannot read step file: {}", e)))
    }

    /// Read a step's explicit inverse, if one exists.
    pub fn down_sql(&self, step: &str) -> DbResult<Option<String>> {
        let file = self.path.join(format!("{}.down.sql", step));
        if !file.exists() {
            return Ok(None);
        }
        let sql = fs::read_to_string(&file)
            .map_err(|e| DbError::migration(step, format!("Cannot read inverse file: {}", e)))?;
        Ok(Some(sql))
    }

    /// Delete every step file (and any inverse files). Used by merge.
    pub fn remove_all(&self) -> DbResult<()> {
        for step in self.scan()? {
            fs::remove_file(self.path.join(format!("{}.sql", step)))?;
            let down = self.path.join(format!("{}.down.sql", step));
            if down.exists() {
                fs::remove_file(down)?;
            }
        }
        Ok(())
    }

    /// Create the history table when absent. Safe to call on every run.
    pub async fn ensure_history(&self, manager: &ConnectionManager, scope: ScopeId) -> DbResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             name VARCHAR(255) NOT NULL PRIMARY KEY, \
             migrated_at VARCHAR(32) NOT NULL)",
            HISTORY_TABLE
        );
        manager.execute(scope, &sql).await?;
        Ok(())
    }

    /// Names of applied steps in application order.
    pub async fn applied(
        &self,
        manager: &ConnectionManager,
        scope: ScopeId,
    ) -> DbResult<Vec<String>> {
        let sql = format!("SELECT name FROM {} ORDER BY name", HISTORY_TABLE);
        manager.fetch_strings(scope, &sql).await
    }

    /// The most recently applied step, if any.
    pub async fn last_applied(
        &self,
        manager: &ConnectionManager,
        scope: ScopeId,
    ) -> DbResult<Option<String>> {
        Ok(self.applied(manager, scope).await?.pop())
    }

    /// Append a history record for an applied step. Runs inside the same
    /// transaction as the step body, so the two commit or roll back together.
    pub async fn record(
        &self,
        manager: &ConnectionManager,
        scope: ScopeId,
        step: &str,
    ) -> DbResult<()> {
        let sql = format!(
            "INSERT INTO {} (name, migrated_at) VALUES ({})",
            HISTORY_TABLE,
            self.db_type.placeholders(2)
        );
        let migrated_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        manager.execute_bind(scope, &sql, &[step, &migrated_at]).await?;
        debug!(step = %step, "Recorded history");
        Ok(())
    }

    /// Delete the history record for a step (rollback).
    pub async fn forget(
        &self,
        manager: &ConnectionManager,
        scope: ScopeId,
        step: &str,
    ) -> DbResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE name = {}",
            HISTORY_TABLE,
            self.db_type.placeholders(1)
        );
        manager.execute_bind(scope, &sql, &[step]).await?;
        Ok(())
    }

    /// Delete every history record. Used by merge.
    pub async fn clear_history(
        &self,
        manager: &ConnectionManager,
        scope: ScopeId,
    ) -> DbResult<()> {
        let sql = format!("DELETE FROM {}", HISTORY_TABLE);
        manager.execute(scope, &sql).await?;
        Ok(())
    }
}

/// Split a step body into executable statements: strip `--` comment lines,
/// split on `;`, drop empties. Good enough for DDL bodies; statements that
/// embed literal semicolons belong in separate steps.
pub fn split_statements(sql: &str) -> Vec<String> {
    let stripped: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    stripped
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `NNN_name.sql` into the step name `NNN_name`; anything else
/// (including `.down.sql` inverses) is not a step.
fn step_name(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(".sql")?;
    if stem.ends_with(".down") {
        return None;
    }
    let (seq, rest) = stem.split_at_checked(SEQUENCE_WIDTH)?;
    if !seq.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let name = rest.strip_prefix('_')?;
    if name.is_empty() {
        return None;
    }
    Some(stem)
}

fn validate_name(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid_input("Migration name must not be empty"));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        return Err(DbError::invalid_input(format!(
            "Migration name '{}' may only contain letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> MigrationStore {
        MigrationStore::new(dir.path().join("migrations"), DatabaseType::SQLite)
    }

    #[test]
    fn test_scan_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.scan().unwrap().is_empty());
        assert!(store.path().is_dir());
    }

    #[test]
    fn test_create_allocates_padded_sequence() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.create("init").unwrap(), "000_init");
        assert_eq!(store.create("add_users").unwrap(), "001_add_users");
        assert_eq!(store.scan().unwrap(), vec!["000_init", "001_add_users"]);
    }

    #[test]
    fn test_scan_ignores_foreign_and_inverse_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("init").unwrap();
        fs::write(store.path().join("000_init.down.sql"), "DROP TABLE t;").unwrap();
        fs::write(store.path().join("README.md"), "notes").unwrap();
        fs::write(store.path().join("12_short.sql"), "").unwrap();
        assert_eq!(store.scan().unwrap(), vec!["000_init"]);
    }

    #[test]
    fn test_create_refuses_to_overflow_sequence_width() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.scan().unwrap();
        for i in 0..999 {
            fs::write(store.path().join(format!("{:03}_step{}.sql", i, i)), "").unwrap();
        }

        // The last expressible sequence still works.
        assert_eq!(store.create("cap").unwrap(), "999_cap");
        assert_eq!(store.scan().unwrap().len(), 1000);

        let err = store.create("overflow").unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(err.to_string().contains("merge"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.create("").is_err());
        assert!(store.create("bad name").is_err());
        assert!(store.create("semi;colon").is_err());
    }

    #[test]
    fn test_create_from_ops_renders_statements() {
        use crate::migrate::migrator::ColumnDef;

        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut m = SchemaMigrator::new(DatabaseType::SQLite);
        m.add_column("users", ColumnDef::new("email", "TEXT"));
        let step = store.create_from_ops("add_email", &m).unwrap();
        let body = store.read_step(&step).unwrap();
        assert!(body.contains("ALTER TABLE users ADD COLUMN email TEXT;"));
    }

    #[test]
    fn test_down_sql_absent_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let step = store.create("init").unwrap();
        assert!(store.down_sql(&step).unwrap().is_none());
        fs::write(store.path().join("000_init.down.sql"), "DROP TABLE t;").unwrap();
        assert!(store.down_sql(&step).unwrap().is_some());
    }

    #[test]
    fn test_split_statements() {
        let body = "-- comment\nCREATE TABLE t (id INTEGER);\n\nINSERT INTO t VALUES (1);\n";
        let stmts = split_statements(body);
        assert_eq!(
            stmts,
            vec!["CREATE TABLE t (id INTEGER)", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn test_step_name_matcher() {
        assert_eq!(step_name("000_init.sql"), Some("000_init"));
        assert_eq!(step_name("010_add_users.sql"), Some("010_add_users"));
        assert_eq!(step_name("000_init.down.sql"), None);
        assert_eq!(step_name("no_sequence.sql"), None);
        assert_eq!(step_name("000_.sql"), None);
        assert_eq!(step_name("000init.sql"), None);
    }
}
