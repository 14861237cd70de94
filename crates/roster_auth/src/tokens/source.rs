//! Storage tiers the token manager reads credentials from.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::db::MemberStore;
use crate::error::AuthResult;
use crate::legacy::{LegacyEntry, LegacyStore};
use crate::models::{Account, Credential};

/// One tier of credential storage.
///
/// Tiers are consulted in order; a tier that yields nothing hands over to
/// the next one.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Short name for logs and status reports.
    fn name(&self) -> &'static str;

    /// Decrypted credential for the account, if this tier has a usable one.
    async fn load(&self, account: &Account) -> AuthResult<Option<Credential>>;

    /// Whether refreshed credentials are persisted back to this tier.
    fn writes_back(&self) -> bool;

    /// Persist a refreshed credential. Returns `false` if the account is gone.
    async fn store(&self, account: &Account, credential: &Credential) -> AuthResult<bool>;

    /// Stop serving a credential whose refresh token the provider revoked.
    ///
    /// Only drops the stored credential if it still carries `refresh_token`.
    /// Returns `false` if nothing was dropped.
    async fn discard(&self, account: &Account, refresh_token: &str) -> AuthResult<bool>;

    /// Deactivate the account after its refresh token was revoked.
    async fn mark_revoked(&self, account: &Account) -> AuthResult<bool>;
}

/// The member database; the primary tier.
#[derive(Debug, Clone)]
pub struct DurableSource {
    members: MemberStore,
}

impl DurableSource {
    pub fn new(members: MemberStore) -> Self {
        Self { members }
    }
}

#[async_trait]
impl TokenSource for DurableSource {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn load(&self, account: &Account) -> AuthResult<Option<Credential>> {
        self.members.load_credential(account.external_id).await
    }

    fn writes_back(&self) -> bool {
        true
    }

    async fn store(&self, account: &Account, credential: &Credential) -> AuthResult<bool> {
        self.members
            .update_credential(account.external_id, credential)
            .await
    }

    async fn discard(&self, account: &Account, refresh_token: &str) -> AuthResult<bool> {
        let current = self.members.load_credential(account.external_id).await?;
        match current {
            Some(credential) if credential.refresh_token.as_deref() == Some(refresh_token) => {
                self.members.clear_credential(account.external_id).await
            }
            _ => Ok(false),
        }
    }

    async fn mark_revoked(&self, account: &Account) -> AuthResult<bool> {
        self.members.deactivate(account.external_id).await
    }
}

/// The legacy registry, looked up by local id. Read-only for tokens.
///
/// An entry is only used when it belongs to the same external account; a
/// local id re-linked to another account yields nothing.
#[derive(Debug, Clone)]
pub struct LegacySource {
    store: Arc<LegacyStore>,
}

impl LegacySource {
    pub fn new(store: Arc<LegacyStore>) -> Self {
        Self { store }
    }

    fn entry_for(&self, account: &Account) -> Option<LegacyEntry> {
        let entry = self.store.get_by_local_id(&account.local_id)?;
        if entry.external_id != account.external_id {
            debug!(
                "Legacy entry for {} belongs to account {}, not {}",
                account.local_id, entry.external_id, account.external_id
            );
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl TokenSource for LegacySource {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn load(&self, account: &Account) -> AuthResult<Option<Credential>> {
        Ok(self
            .entry_for(account)
            .and_then(|entry| self.store.decrypt_credential(&entry)))
    }

    fn writes_back(&self) -> bool {
        false
    }

    async fn store(&self, account: &Account, _credential: &Credential) -> AuthResult<bool> {
        debug!(
            "Not writing refreshed credential for {} back to the legacy registry",
            account.external_id
        );
        Ok(false)
    }

    async fn discard(&self, _account: &Account, _refresh_token: &str) -> AuthResult<bool> {
        // The registry's credentials are never rewritten; the manager
        // remembers the revoked token instead.
        Ok(false)
    }

    async fn mark_revoked(&self, account: &Account) -> AuthResult<bool> {
        match self.entry_for(account) {
            Some(entry) => self.store.deactivate(entry.external_id).await,
            None => Ok(false),
        }
    }
}
