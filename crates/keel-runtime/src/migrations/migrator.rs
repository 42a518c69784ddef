//! Migration orchestrator with mesh-safe locking.
//!
//! Every mutating operation runs while holding the backend's cross-process
//! migration lock, so concurrent deployments never race on check-then-apply.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use keel_core::error::{KeelError, Result};
use keel_core::migration::{AppliedMigration, Migration, MigrationStatus, RunReport};
use keel_core::registry::MigrationRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{MigrationBackend, UnlockOutcome};

/// Applies, reverts and inspects migrations against one database.
pub struct Migrator {
    backend: Arc<dyn MigrationBackend>,
    registry: Arc<MigrationRegistry>,
    verify_checksums: bool,
    cancel: CancellationToken,
}

impl Migrator {
    pub fn new(backend: Arc<dyn MigrationBackend>, registry: Arc<MigrationRegistry>) -> Self {
        Self {
            backend,
            registry,
            verify_checksums: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether `run_migrations` refuses to proceed when applied SQL changed.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Stop a run before the next migration once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Create the ledger table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        self.with_lock(|| self.backend.ensure_ledger()).await
    }

    /// Whether the ledger records `id` as applied.
    ///
    /// Read-only: a missing ledger table is `LedgerUnavailable`, not `false`.
    pub async fn is_migration_executed(&self, id: &str) -> Result<bool> {
        self.backend.is_applied(id).await
    }

    /// Apply one migration and record it in the ledger.
    pub async fn execute_migration(&self, migration: &Migration) -> Result<AppliedMigration> {
        self.with_lock(|| async {
            self.backend.ensure_ledger().await?;
            self.apply_one(migration).await
        })
        .await
    }

    /// Revert one applied migration and remove its ledger entry.
    pub async fn rollback_migration(&self, migration: &Migration) -> Result<()> {
        self.with_lock(|| async {
            self.backend.ensure_ledger().await?;
            self.revert_one(migration).await
        })
        .await
    }

    /// Apply every pending migration in registry order.
    ///
    /// Stops at the first failure; nothing after the failing migration is
    /// attempted.
    pub async fn run_migrations(&self) -> Result<RunReport> {
        self.with_lock(|| self.run_pending()).await
    }

    /// Revert the `count` most recently applied migrations, newest first.
    pub async fn rollback_last(&self, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.with_lock(|| self.rollback_recent(count)).await
    }

    /// Compare the registry with the ledger.
    pub async fn status(&self) -> Result<MigrationStatus> {
        self.with_lock(|| async {
            self.backend.ensure_ledger().await?;
            let applied = self.backend.applied().await?;
            Ok(self.compare(applied))
        })
        .await
    }

    /// Clear a migration lock left behind by a crashed process.
    pub async fn force_unlock(&self) -> Result<UnlockOutcome> {
        warn!("Forcibly clearing the migration lock");
        self.backend.force_unlock().await
    }

    async fn with_lock<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.backend.acquire_lock().await?;

        let result = op().await;

        // Always release lock, even on error
        if let Err(e) = self.backend.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    async fn run_pending(&self) -> Result<RunReport> {
        self.backend.ensure_ledger().await?;

        let applied = self.backend.applied().await?;
        debug!("Already applied migrations: {}", applied.len());
        self.check_ledger(&applied)?;

        let applied: HashMap<String, AppliedMigration> =
            applied.into_iter().map(|m| (m.id.clone(), m)).collect();

        let mut report = RunReport::default();
        for migration in self.registry.iter() {
            if applied.contains_key(&migration.id) {
                report.skipped.push(migration.id.clone());
                continue;
            }

            if self.cancel.is_cancelled() {
                warn!(
                    next = %migration.id,
                    "Migration run cancelled before starting the next migration"
                );
                return Err(KeelError::Cancelled {
                    completed: report.applied_ids(),
                });
            }

            match self.apply_one(migration).await {
                Ok(entry) => report.applied.push(entry),
                Err(e) => {
                    error!(
                        migration = %migration.id,
                        error = %e,
                        "Migration failed, halting run"
                    );
                    return Err(KeelError::Halted {
                        migration: migration.id.clone(),
                        completed: report.applied_ids(),
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Migrations complete"
        );
        Ok(report)
    }

    async fn rollback_recent(&self, count: usize) -> Result<Vec<String>> {
        self.backend.ensure_ledger().await?;

        let mut applied = self.backend.applied().await?;
        // Newest first; registry order breaks timestamp ties
        applied.sort_by_key(|m| (m.applied_at, self.registry.position(&m.id)));
        applied.reverse();
        applied.truncate(count);

        let targets = applied
            .iter()
            .map(|entry| {
                self.registry
                    .get(&entry.id)
                    .ok_or_else(|| KeelError::UnknownMigration(entry.id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rolled_back = Vec::with_capacity(targets.len());
        for migration in targets {
            if self.cancel.is_cancelled() {
                warn!(
                    next = %migration.id,
                    "Rollback cancelled before reverting the next migration"
                );
                return Err(KeelError::Cancelled {
                    completed: rolled_back,
                });
            }

            if let Err(e) = self.revert_one(migration).await {
                error!(
                    migration = %migration.id,
                    error = %e,
                    "Rollback failed, halting"
                );
                return Err(KeelError::Halted {
                    migration: migration.id.clone(),
                    completed: rolled_back,
                    source: Box::new(e),
                });
            }
            rolled_back.push(migration.id.clone());
        }

        Ok(rolled_back)
    }

    /// Refuse to run when applied migrations were edited, and point out
    /// ledger entries the registry does not know about.
    fn check_ledger(&self, applied: &[AppliedMigration]) -> Result<()> {
        let mut last_applied_position = None;

        for entry in applied {
            let Some(migration) = self.registry.get(&entry.id) else {
                warn!(
                    migration = %entry.id,
                    "Ledger contains a migration that is not registered"
                );
                continue;
            };

            if self.verify_checksums {
                let current = migration.checksum();
                if current != entry.checksum {
                    return Err(KeelError::ChecksumMismatch {
                        migration: entry.id.clone(),
                        recorded: entry.checksum.clone(),
                        current,
                    });
                }
            }

            last_applied_position = last_applied_position.max(self.registry.position(&entry.id));
        }

        if let Some(last) = last_applied_position {
            let applied_ids: Vec<&str> = applied.iter().map(|m| m.id.as_str()).collect();
            for migration in self.registry.iter().take(last) {
                if !applied_ids.contains(&migration.id.as_str()) {
                    warn!(
                        migration = %migration.id,
                        "Pending migration precedes already-applied ones; applying out of order"
                    );
                }
            }
        }

        Ok(())
    }

    fn compare(&self, applied: Vec<AppliedMigration>) -> MigrationStatus {
        let mut by_id: HashMap<String, AppliedMigration> =
            applied.into_iter().map(|m| (m.id.clone(), m)).collect();

        let mut status = MigrationStatus::default();
        for migration in self.registry.iter() {
            match by_id.remove(&migration.id) {
                Some(entry) => status.applied.push(entry),
                None => status.pending.push(migration.id.clone()),
            }
        }

        let mut unknown: Vec<AppliedMigration> = by_id.into_values().collect();
        unknown.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then(a.id.cmp(&b.id)));
        status.unknown = unknown;
        status
    }

    async fn apply_one(&self, migration: &Migration) -> Result<AppliedMigration> {
        info!(migration = %migration.id, "Applying migration");
        let started = Instant::now();

        let entry = self.backend.apply(migration).await?;

        info!(
            migration = %migration.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migration applied"
        );
        Ok(entry)
    }

    async fn revert_one(&self, migration: &Migration) -> Result<()> {
        info!(migration = %migration.id, "Rolling back migration");
        let started = Instant::now();

        self.backend.revert(migration).await?;

        info!(
            migration = %migration.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migration rolled back"
        );
        Ok(())
    }
}
