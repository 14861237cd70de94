//! One-time backfill of the member database from the legacy snapshot.
//!
//! The run is recorded in the `migration_log` ledger. A successful run is
//! terminal: later startups see the ledger row and do nothing. A failed run
//! (any record rejected, or an unreadable snapshot) is retried on the next
//! startup; records imported by an earlier attempt are skipped, not
//! duplicated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::db::MemberStore;
use crate::error::{AuthError, AuthResult};
use crate::legacy::{LegacyEntry, RawSnapshot};
use crate::models::MigrationLedgerEntry;

/// Ledger name of the legacy registry migration.
pub const LEGACY_MIGRATION_NAME: &str = "legacy_flat_store_v1";

/// Where a migration stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    NotStarted,
    /// A [`MigrationCoordinator::run`] is executing right now.
    InProgress,
    Succeeded,
    Failed,
}

/// Result of one processed run.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    /// `Succeeded` or `Failed`.
    pub state: MigrationState,
    pub imported: usize,
    /// Records whose account already existed.
    pub skipped: usize,
    pub errors: Vec<String>,
    pub backup_path: Option<PathBuf>,
}

/// What a call to [`MigrationCoordinator::run`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// No legacy snapshot exists; nothing was recorded.
    NoLegacyData,
    /// The ledger already holds a successful run.
    AlreadyMigrated { executed_at: i64 },
    /// The snapshot was processed and the ledger written.
    Completed(MigrationReport),
}

impl MigrationOutcome {
    /// Whether startup may proceed as fully migrated.
    pub fn is_success(&self) -> bool {
        match self {
            Self::NoLegacyData | Self::AlreadyMigrated { .. } => true,
            Self::Completed(report) => report.state == MigrationState::Succeeded,
        }
    }
}

impl MemberStore {
    /// Get the ledger row for a migration.
    pub async fn get_migration(&self, name: &str) -> AuthResult<Option<MigrationLedgerEntry>> {
        let entry = sqlx::query_as::<_, MigrationLedgerEntry>(
            r#"
            SELECT name, success, error_message, data_backup, executed_at
            FROM migration_log
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(entry)
    }

    /// List every ledger row.
    pub async fn list_migrations(&self) -> AuthResult<Vec<MigrationLedgerEntry>> {
        let entries = sqlx::query_as::<_, MigrationLedgerEntry>(
            "SELECT name, success, error_message, data_backup, executed_at FROM migration_log ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(entries)
    }

    /// Write the ledger row for a migration, replacing an earlier attempt.
    pub async fn record_migration(&self, entry: &MigrationLedgerEntry) -> AuthResult<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_log (name, success, error_message, data_backup, executed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                success = excluded.success,
                error_message = excluded.error_message,
                data_backup = excluded.data_backup,
                executed_at = excluded.executed_at
            "#,
        )
        .bind(&entry.name)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(&entry.data_backup)
        .bind(entry.executed_at)
        .execute(self.pool())
        .await
        .map_err(|source| AuthError::Ledger {
            name: entry.name.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Moves legacy snapshot records into the member database.
///
/// Clones share one run lock, so runs never overlap.
#[derive(Debug, Clone)]
pub struct MigrationCoordinator {
    members: MemberStore,
    legacy_path: PathBuf,
    backup_dir: PathBuf,
    running: Arc<Mutex<()>>,
}

impl MigrationCoordinator {
    pub fn new(
        members: MemberStore,
        legacy_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            members,
            legacy_path: legacy_path.into(),
            backup_dir: backup_dir.into(),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Current state: `InProgress` while a run holds the lock, otherwise
    /// whatever the ledger says.
    pub async fn state(&self) -> AuthResult<MigrationState> {
        if self.running.try_lock().is_err() {
            return Ok(MigrationState::InProgress);
        }
        Ok(match self.members.get_migration(LEGACY_MIGRATION_NAME).await? {
            None => MigrationState::NotStarted,
            Some(entry) if entry.success => MigrationState::Succeeded,
            Some(_) => MigrationState::Failed,
        })
    }

    /// Run the migration if it has not already succeeded.
    ///
    /// Record-level problems are collected and reported, never fatal. Only a
    /// failure to write the ledger is returned as an error.
    pub async fn run(&self) -> AuthResult<MigrationOutcome> {
        let _running = self.running.lock().await;

        if let Some(entry) = self.members.get_migration(LEGACY_MIGRATION_NAME).await? {
            if entry.success {
                info!(
                    "Migration {} already completed at {}",
                    LEGACY_MIGRATION_NAME, entry.executed_at
                );
                return Ok(MigrationOutcome::AlreadyMigrated {
                    executed_at: entry.executed_at,
                });
            }
            warn!(
                "Retrying migration {} after earlier failure: {}",
                LEGACY_MIGRATION_NAME,
                entry.error_message.as_deref().unwrap_or("unknown error")
            );
        }

        let content = match tokio::fs::read_to_string(&self.legacy_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No legacy snapshot at {}; nothing to migrate",
                    self.legacy_path.display()
                );
                return Ok(MigrationOutcome::NoLegacyData);
            }
            Err(e) => {
                let message = format!(
                    "failed to read legacy snapshot {}: {}",
                    self.legacy_path.display(),
                    e
                );
                return self.finish(0, 0, vec![message], None, None).await;
            }
        };

        info!(
            "Migration {} in progress from {}",
            LEGACY_MIGRATION_NAME,
            self.legacy_path.display()
        );

        let mut imported = 0;
        let mut skipped = 0;
        let mut errors = Vec::new();

        match RawSnapshot::parse(&content) {
            Ok(snapshot) => {
                for (position, record) in snapshot.accounts.into_iter().enumerate() {
                    let entry = match LegacyEntry::from_value(record) {
                        Ok(entry) => entry,
                        Err(e) => {
                            errors.push(format!("record #{position}: {e}"));
                            continue;
                        }
                    };
                    match self.members.import_account(&entry.to_account()).await {
                        Ok(true) => imported += 1,
                        Ok(false) => skipped += 1,
                        Err(e) => errors.push(format!(
                            "record #{position} (external id {}): {e}",
                            entry.external_id
                        )),
                    }
                }
            }
            Err(e) => errors.push(format!("unparsable legacy snapshot: {e}")),
        }

        let backup_path = match self.backup().await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to back up legacy snapshot: {}", e);
                None
            }
        };

        self.finish(imported, skipped, errors, Some(content), backup_path)
            .await
    }

    async fn finish(
        &self,
        imported: usize,
        skipped: usize,
        errors: Vec<String>,
        data_backup: Option<String>,
        backup_path: Option<PathBuf>,
    ) -> AuthResult<MigrationOutcome> {
        let success = errors.is_empty();
        let entry = MigrationLedgerEntry {
            name: LEGACY_MIGRATION_NAME.to_string(),
            success,
            error_message: (!success).then(|| errors.join("\n")),
            data_backup,
            executed_at: Utc::now().timestamp(),
        };

        if let Err(e) = self.members.record_migration(&entry).await {
            error!("Could not record migration outcome: {}", e);
            return Err(e);
        }

        let state = if success {
            info!(
                "Migration {} succeeded: {} imported, {} already present",
                LEGACY_MIGRATION_NAME, imported, skipped
            );
            MigrationState::Succeeded
        } else {
            warn!(
                "Migration {} finished with {} errors ({} imported, {} already present); will retry next startup",
                LEGACY_MIGRATION_NAME,
                errors.len(),
                imported,
                skipped
            );
            MigrationState::Failed
        };

        Ok(MigrationOutcome::Completed(MigrationReport {
            state,
            imported,
            skipped,
            errors,
            backup_path,
        }))
    }

    /// Copy the legacy file to a timestamped path in the backup directory.
    async fn backup(&self) -> AuthResult<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let target = self.backup_dir.join(backup_file_name(&self.legacy_path));
        tokio::fs::copy(&self.legacy_path, &target).await?;
        info!("Backed up legacy snapshot to {}", target.display());
        Ok(target)
    }
}

fn backup_file_name(source: &Path) -> String {
    let stem = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "legacy.json".to_string());
    format!("{stem}.{}.bak", Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
}
