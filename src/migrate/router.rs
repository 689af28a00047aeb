//! Orders migration work: diffs available steps against history, runs
//! pending steps, rolls back the last one, merges the whole set.
//!
//! Each step runs inside one transaction together with its history record,
//! so a crash between schema change and history write leaves the two
//! consistent - either both happened or neither did. A failed step aborts
//! the run; earlier, already committed steps stay applied.

use crate::conn::manager::ConnectionManager;
use crate::conn::registry::ScopeId;
use crate::error::{DbError, DbResult};
use crate::migrate::store::{MigrationStore, split_statements};
use std::path::PathBuf;
use tracing::{info, warn};

pub struct MigrationRouter<'a> {
    manager: &'a ConnectionManager,
    store: MigrationStore,
}

impl<'a> MigrationRouter<'a> {
    pub fn new(manager: &'a ConnectionManager, migrations_path: impl Into<PathBuf>) -> Self {
        let store = MigrationStore::new(migrations_path, manager.connect_info().db_type);
        Self { manager, store }
    }

    pub fn store(&self) -> &MigrationStore {
        &self.store
    }

    /// Steps recorded as applied, in application order.
    pub async fn done(&self, scope: ScopeId) -> DbResult<Vec<String>> {
        self.manager
            .scoped(scope, || async {
                self.store.ensure_history(self.manager, scope).await?;
                self.store.applied(self.manager, scope).await
            })
            .await
    }

    /// Steps present on disk but absent from history, in ascending sequence
    /// order.
    pub async fn pending(&self, scope: ScopeId) -> DbResult<Vec<String>> {
        let available = self.store.scan()?;
        let applied = self.done(scope).await?;
        Ok(available
            .into_iter()
            .filter(|step| !applied.contains(step))
            .collect())
    }

    /// Create a new step file; returns the generated `NNN_name`.
    pub fn create(&self, name: &str) -> DbResult<String> {
        self.store.create(name)
    }

    /// Apply pending steps in order. With `target`, stop after applying that
    /// step even if later ones are pending. With `fake`, record history
    /// without executing step bodies (reconciles history after manual schema
    /// changes). Nothing pending is a no-op. Returns the steps applied.
    pub async fn run(
        &self,
        scope: ScopeId,
        target: Option<&str>,
        fake: bool,
    ) -> DbResult<Vec<String>> {
        let pending = self.pending(scope).await?;
        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(Vec::new());
        }
        if let Some(target) = target {
            if !pending.iter().any(|step| step == target) {
                return Err(DbError::invalid_input(format!(
                    "Target migration '{}' is not pending",
                    target
                )));
            }
        }

        let mut applied = Vec::new();
        for step in pending {
            self.manager.acquire(scope).await?;
            let outcome = self.apply_step(scope, &step, fake).await;
            if outcome.is_err() {
                self.manager.mark_failed(scope).await;
            }
            let released = self.manager.release(scope).await;
            outcome?;
            released?;

            info!(step = %step, fake, "Migration applied");
            applied.push(step.clone());
            if target == Some(step.as_str()) {
                break;
            }
        }
        Ok(applied)
    }

    /// One step's transaction: body statements (unless faked) plus the
    /// history record.
    async fn apply_step(&self, scope: ScopeId, step: &str, fake: bool) -> DbResult<()> {
        if !fake {
            let body = self.store.read_step(step)?;
            for statement in split_statements(&body) {
                self.manager
                    .execute(scope, &statement)
                    .await
                    .map_err(|e| DbError::migration(step, e.to_string()))?;
            }
        }
        self.store.record(self.manager, scope, step).await
    }

    /// Roll back the most recently applied step. Deletes its history record;
    /// schema changes are only inverted when the step ships an explicit
    /// `.down.sql` inverse. Returns the rolled-back step's name.
    pub async fn rollback(&self, scope: ScopeId) -> DbResult<String> {
        self.manager
            .scoped(scope, || async {
                self.store.ensure_history(self.manager, scope).await?;
                let Some(step) = self.store.last_applied(self.manager, scope).await? else {
                    return Err(DbError::invalid_input("No migrations to roll back"));
                };

                match self.store.down_sql(&step)? {
                    Some(inverse) => {
                        for statement in split_statements(&inverse) {
                            self.manager
                                .execute(scope, &statement)
                                .await
                                .map_err(|e| DbError::migration(&step, e.to_string()))?;
                        }
                    }
                    None => {
                        warn!(step = %step, "No inverse defined; removing history record only");
                    }
                }

                self.store.forget(self.manager, scope, &step).await?;
                info!(step = %step, "Migration rolled back");
                Ok(step)
            })
            .await
    }

    /// Collapse every step on disk into a single new step carrying all their
    /// statements, and reset history to that one step. The database schema is
    /// untouched.
    pub async fn merge(&self, scope: ScopeId, name: &str) -> DbResult<String> {
        let steps = self.store.scan()?;
        if steps.is_empty() {
            return Err(DbError::invalid_input("No migrations to merge"));
        }

        let mut body = String::new();
        for step in &steps {
            body.push_str("-- from ");
            body.push_str(step);
            body.push('\n');
            body.push_str(&self.store.read_step(step)?);
            if !body.ends_with('\n') {
                body.push('\n');
            }
        }

        self.manager
            .scoped(scope, || async {
                self.store.ensure_history(self.manager, scope).await?;
                self.store.clear_history(self.manager, scope).await
            })
            .await?;

        self.store.remove_all()?;
        let merged = self.store.create_with_body(name, &body)?;

        self.manager
            .scoped(scope, || async {
                self.store.record(self.manager, scope, &merged).await
            })
            .await?;

        info!(step = %merged, collapsed = steps.len(), "Migrations merged");
        Ok(merged)
    }
}
