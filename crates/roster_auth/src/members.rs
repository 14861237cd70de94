//! Account registration and credential storage on the member store.
//!
//! Identity invariants are checked inside a transaction before each write and
//! backed by the schema (primary key on `external_id`, partial unique index on
//! active `local_id`), so a race between two registrations still ends in a
//! conflict rather than a duplicate.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::MemberStore;
use crate::error::{AuthError, AuthResult, ConflictKind};
use crate::models::{
    validate_identity, Account, AccountRow, Credential, RaceEntry, RaceEntryRow,
};

const ACCOUNT_COLUMNS: &str = "external_id, local_id, is_active, profile, encrypted_credential, registered_at, updated_at";

impl MemberStore {
    /// Register a new account, or re-register a deactivated one in place.
    ///
    /// Fails with `DuplicateActiveExternalId` if an active account already
    /// exists for `external_id`, and with `DuplicateLocalId` if a different
    /// active account holds `local_id`. Without an encryption key the account
    /// is registered with no credential.
    pub async fn register(
        &self,
        local_id: &str,
        external_id: i64,
        profile: &serde_json::Value,
        credential: &Credential,
    ) -> AuthResult<Account> {
        validate_identity(local_id, external_id)?;

        let sealed = match self.cipher().encrypt(credential) {
            Some(blob) => Some(serde_json::to_string(&blob)?),
            None => {
                warn!(
                    "Registering account {} without a stored credential: encryption is not configured",
                    external_id
                );
                None
            }
        };
        let profile_json = serde_json::to_string(profile)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool().begin().await?;

        let existing: Option<(bool,)> =
            sqlx::query_as("SELECT is_active FROM accounts WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((true,)) = existing {
            return Err(AuthError::conflict(
                ConflictKind::DuplicateActiveExternalId,
                external_id.to_string(),
            ));
        }

        let holder: Option<(i64,)> = sqlx::query_as(
            "SELECT external_id FROM accounts WHERE local_id = ? AND is_active = 1 AND external_id != ?",
        )
        .bind(local_id)
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await?;

        if holder.is_some() {
            return Err(AuthError::conflict(ConflictKind::DuplicateLocalId, local_id));
        }

        let result = if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE accounts SET
                    local_id = ?,
                    is_active = 1,
                    profile = ?,
                    encrypted_credential = ?,
                    updated_at = ?
                WHERE external_id = ?
                "#,
            )
            .bind(local_id)
            .bind(&profile_json)
            .bind(&sealed)
            .bind(now)
            .bind(external_id)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                INSERT INTO accounts (
                    external_id, local_id, is_active, profile, encrypted_credential,
                    registered_at, updated_at
                ) VALUES (?, ?, 1, ?, ?, ?, ?)
                "#,
            )
            .bind(external_id)
            .bind(local_id)
            .bind(&profile_json)
            .bind(&sealed)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
        };
        result.map_err(|e| map_unique_violation(e, external_id, local_id))?;

        tx.commit().await?;

        info!(
            "Registered account {} for local user {}{}",
            external_id,
            local_id,
            if existing.is_some() { " (re-registered)" } else { "" }
        );

        self.get_by_external_id(external_id)
            .await?
            .ok_or_else(|| AuthError::validation(format!("account {external_id} vanished after registration")))
    }

    /// Get an account by its provider identity, active or not.
    pub async fn get_by_external_id(&self, external_id: i64) -> AuthResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| r.to_account()).transpose()
    }

    /// Get the active account for a chat-platform user.
    pub async fn get_by_local_id(&self, local_id: &str) -> AuthResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE local_id = ? AND is_active = 1"
        ))
        .bind(local_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| r.to_account()).transpose()
    }

    /// List all active accounts, ordered by registration.
    pub async fn list_active_accounts(&self) -> AuthResult<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE is_active = 1 ORDER BY registered_at, external_id"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(AccountRow::to_account).collect()
    }

    /// Count accounts, active and inactive.
    pub async fn count_accounts(&self) -> AuthResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(self.pool())
            .await?;
        Ok(count as u64)
    }

    /// Decrypt the stored credential for an account.
    ///
    /// `None` if the account is unknown, has no credential, or the blob does
    /// not decrypt with the configured key.
    pub async fn load_credential(&self, external_id: i64) -> AuthResult<Option<Credential>> {
        let Some(account) = self.get_by_external_id(external_id).await? else {
            return Ok(None);
        };
        Ok(account
            .encrypted_credential
            .as_ref()
            .and_then(|blob| self.cipher().decrypt(blob)))
    }

    /// Re-encrypt and store a credential.
    ///
    /// Returns `false` if no account matched. Fails with `NoEncryptionKey`
    /// if encryption is not configured.
    pub async fn update_credential(
        &self,
        external_id: i64,
        credential: &Credential,
    ) -> AuthResult<bool> {
        if !self.cipher().is_enabled() {
            return Err(AuthError::NoEncryptionKey);
        }
        let blob = self
            .cipher()
            .encrypt(credential)
            .ok_or(AuthError::NoEncryptionKey)?;
        let sealed = serde_json::to_string(&blob)?;
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE accounts SET encrypted_credential = ?, updated_at = ? WHERE external_id = ?",
        )
        .bind(&sealed)
        .bind(now)
        .bind(external_id)
        .execute(self.pool())
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            debug!("Stored refreshed credential for account {}", external_id);
        }
        Ok(updated)
    }

    /// Drop the stored credential. Returns `false` if no account matched.
    pub async fn clear_credential(&self, external_id: i64) -> AuthResult<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE accounts SET encrypted_credential = NULL, updated_at = ? WHERE external_id = ?",
        )
        .bind(now)
        .bind(external_id)
        .execute(self.pool())
        .await?;

        let cleared = result.rows_affected() > 0;
        if cleared {
            info!("Cleared stored credential for account {}", external_id);
        }
        Ok(cleared)
    }

    /// Mark an account inactive. Returns `false` if no account matched.
    pub async fn deactivate(&self, external_id: i64) -> AuthResult<bool> {
        let now = Utc::now().timestamp();
        let result =
            sqlx::query("UPDATE accounts SET is_active = 0, updated_at = ? WHERE external_id = ?")
                .bind(now)
                .bind(external_id)
                .execute(self.pool())
                .await?;

        let matched = result.rows_affected() > 0;
        if matched {
            info!("Deactivated account {}", external_id);
        }
        Ok(matched)
    }

    /// Mark an account active again. Returns `false` if no account matched.
    ///
    /// Fails with `DuplicateLocalId` if another account took the local id
    /// while this one was inactive.
    pub async fn reactivate(&self, external_id: i64) -> AuthResult<bool> {
        let mut tx = self.pool().begin().await?;

        let local: Option<(String,)> =
            sqlx::query_as("SELECT local_id FROM accounts WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((local_id,)) = local else {
            return Ok(false);
        };

        let holder: Option<(i64,)> = sqlx::query_as(
            "SELECT external_id FROM accounts WHERE local_id = ? AND is_active = 1 AND external_id != ?",
        )
        .bind(&local_id)
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await?;
        if holder.is_some() {
            return Err(AuthError::conflict(ConflictKind::DuplicateLocalId, local_id));
        }

        let now = Utc::now().timestamp();
        sqlx::query("UPDATE accounts SET is_active = 1, updated_at = ? WHERE external_id = ?")
            .bind(now)
            .bind(external_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, external_id, &local_id))?;

        tx.commit().await?;
        info!("Reactivated account {}", external_id);
        Ok(true)
    }

    /// Delete an account and everything that depends on it.
    ///
    /// The dependent deletes and the account delete commit together or not
    /// at all. Returns the removed account.
    pub async fn remove(&self, external_id: i64) -> AuthResult<Option<Account>> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let account = row.to_account()?;

        let entries = sqlx::query("DELETE FROM race_entries WHERE external_id = ?")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM accounts WHERE external_id = ?")
            .bind(external_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            "Removed account {} and {} race entries",
            external_id,
            entries.rows_affected()
        );
        Ok(Some(account))
    }

    /// Insert an account exactly as given, keeping its sealed credential.
    ///
    /// Used by the legacy migration. Returns `false` if an account with the
    /// same external id already exists, leaving it untouched.
    pub async fn import_account(&self, account: &Account) -> AuthResult<bool> {
        validate_identity(&account.local_id, account.external_id)?;

        let sealed = account
            .encrypted_credential
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let profile_json = serde_json::to_string(&account.profile)?;

        let result = sqlx::query(
            r#"
            INSERT INTO accounts (
                external_id, local_id, is_active, profile, encrypted_credential,
                registered_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(account.external_id)
        .bind(&account.local_id)
        .bind(account.is_active)
        .bind(&profile_json)
        .bind(&sealed)
        .bind(account.registered_at.timestamp())
        .bind(account.updated_at.timestamp())
        .execute(self.pool())
        .await
        .map_err(|e| map_unique_violation(e, account.external_id, &account.local_id))?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a race entry for an account.
    pub async fn add_race_entry(
        &self,
        external_id: i64,
        race_name: &str,
        payload: &serde_json::Value,
    ) -> AuthResult<RaceEntry> {
        if race_name.trim().is_empty() {
            return Err(AuthError::validation("race name must not be empty"));
        }
        let now = Utc::now().timestamp();
        let payload_json = serde_json::to_string(payload)?;

        let row = sqlx::query_as::<_, RaceEntryRow>(
            r#"
            INSERT INTO race_entries (external_id, race_name, payload, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, external_id, race_name, payload, created_at
            "#,
        )
        .bind(external_id)
        .bind(race_name)
        .bind(&payload_json)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        row.to_entry()
    }

    /// List race entries for an account, oldest first.
    pub async fn list_race_entries(&self, external_id: i64) -> AuthResult<Vec<RaceEntry>> {
        let rows = sqlx::query_as::<_, RaceEntryRow>(
            r#"
            SELECT id, external_id, race_name, payload, created_at
            FROM race_entries
            WHERE external_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(external_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(RaceEntryRow::to_entry).collect()
    }
}

/// Translate a constraint failure into the identity conflict it represents.
fn map_unique_violation(err: sqlx::Error, external_id: i64, local_id: &str) -> AuthError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return if db_err.message().contains("local_id") {
                AuthError::conflict(ConflictKind::DuplicateLocalId, local_id)
            } else {
                AuthError::conflict(
                    ConflictKind::DuplicateActiveExternalId,
                    external_id.to_string(),
                )
            };
        }
    }
    AuthError::Database(err)
}
