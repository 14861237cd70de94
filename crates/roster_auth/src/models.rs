//! Account, credential, and ledger types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cipher::EncryptedBlob;
use crate::error::{AuthError, AuthResult};

/// OAuth credential for one account.
///
/// Only ever stored wrapped in an [`EncryptedBlob`]. The provider's
/// snake_case field names are accepted on input.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(alias = "access_token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    /// Expiry in epoch seconds (UTC). Missing means "treat as expired".
    #[serde(default, alias = "expires_at")]
    pub expires_at: Option<i64>,
    #[serde(default = "default_token_type", alias = "token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Whether the token is still usable `margin_secs` from `now`.
    ///
    /// A credential without an expiry is never fresh.
    pub fn is_fresh(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at > now + margin_secs)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// A registered identity: provider account paired with a chat-platform user.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// Numeric identity from the resource provider.
    pub external_id: i64,
    /// Identity from the chat platform.
    pub local_id: String,
    pub is_active: bool,
    /// Opaque provider profile.
    pub profile: serde_json::Value,
    pub encrypted_credential: Option<EncryptedBlob>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database row for the accounts table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AccountRow {
    pub external_id: i64,
    pub local_id: String,
    pub is_active: bool,
    pub profile: String,
    pub encrypted_credential: Option<String>,
    pub registered_at: i64,
    pub updated_at: i64,
}

impl AccountRow {
    /// Convert database row to Account.
    pub fn to_account(&self) -> AuthResult<Account> {
        let encrypted_credential = self
            .encrypted_credential
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Account {
            external_id: self.external_id,
            local_id: self.local_id.clone(),
            is_active: self.is_active,
            profile: serde_json::from_str(&self.profile)?,
            encrypted_credential,
            registered_at: timestamp_to_datetime(self.registered_at),
            updated_at: timestamp_to_datetime(self.updated_at),
        })
    }
}

/// A race entry owned by an account. Removed together with its account.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceEntry {
    pub id: i64,
    pub external_id: i64,
    pub race_name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RaceEntryRow {
    pub id: i64,
    pub external_id: i64,
    pub race_name: String,
    pub payload: String,
    pub created_at: i64,
}

impl RaceEntryRow {
    pub fn to_entry(&self) -> AuthResult<RaceEntry> {
        Ok(RaceEntry {
            id: self.id,
            external_id: self.external_id,
            race_name: self.race_name.clone(),
            payload: serde_json::from_str(&self.payload)?,
            created_at: timestamp_to_datetime(self.created_at),
        })
    }
}

/// One row of the migration ledger.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MigrationLedgerEntry {
    pub name: String,
    pub success: bool,
    pub error_message: Option<String>,
    /// Copy of the original legacy payload.
    pub data_backup: Option<String>,
    /// Epoch seconds.
    pub executed_at: i64,
}

/// Validate the identity pair used on registration.
pub(crate) fn validate_identity(local_id: &str, external_id: i64) -> AuthResult<()> {
    if local_id.trim().is_empty() {
        return Err(AuthError::validation("local id must not be empty"));
    }
    if external_id <= 0 {
        return Err(AuthError::validation(format!(
            "external id must be positive, got {external_id}"
        )));
    }
    Ok(())
}

/// Convert a Unix timestamp (seconds) to a DateTime<Utc>.
pub(crate) fn timestamp_to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now)
}
