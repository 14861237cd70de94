//! Access-token lifecycle: expiry checks, refresh, and tier fallback.
//!
//! [`TokenManager::valid_access_token`] walks an ordered chain of
//! [`TokenSource`] tiers. The first tier holding a fresh credential answers
//! without a network call. An expiring credential is refreshed through the
//! [`OAuthProvider`]; tiers that write back persist the new credential before
//! it is returned. Refreshes for the same account are shared between
//! concurrent callers, so a rotating refresh token is never spent twice.
//!
//! A refresh token the provider revoked is never sent again: the writing tier
//! drops the credential that carried it, and the manager remembers it for
//! tiers it cannot rewrite.

mod single_flight;
mod source;

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{Account, Credential};
use crate::provider::OAuthProvider;
use single_flight::SingleFlight;

pub use source::{DurableSource, LegacySource, TokenSource};

/// Refresh this long before the recorded expiry.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 3600;

/// What happens to an account whose refresh token was revoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    /// Deactivate the account in the tier that saw the revocation.
    #[default]
    Deactivate,
    /// Leave the account active; the user has to re-authenticate anyway.
    KeepActive,
}

/// Tuning for [`TokenManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSettings {
    pub safety_margin_secs: i64,
    pub revocation_policy: RevocationPolicy,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            revocation_policy: RevocationPolicy::default(),
        }
    }
}

/// Whether an account can currently make authenticated calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessStatus {
    /// A valid token came from the named tier.
    Valid { tier: &'static str },
    /// No tier could produce a token; the user must re-authenticate.
    NeedsReauth,
}

/// Result of a forced refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForcedRefresh {
    /// A new token was obtained (and stored, if the tier writes back).
    Refreshed { expires_at: Option<i64> },
    /// The primary tier holds no usable credential for the account.
    NoCredential,
    /// The stored credential cannot be refreshed.
    NoRefreshToken,
    /// The provider revoked the refresh token.
    Revoked,
    /// The provider call failed; trying again later may work.
    Failed { reason: String },
}

/// Shared result of one refresh attempt on one tier.
#[derive(Debug, Clone)]
enum Flight {
    /// The tier's credential was already fresh when re-read.
    Current(String),
    Refreshed(Credential),
    NoCredential,
    NoRefreshToken,
    Revoked,
    Transient(String),
}

struct ManagerInner {
    sources: Vec<Arc<dyn TokenSource>>,
    provider: Arc<dyn OAuthProvider>,
    clock: Arc<dyn Clock>,
    settings: TokenSettings,
    in_flight: SingleFlight<i64, Flight>,
    /// Refresh tokens the provider has revoked.
    revoked: Mutex<HashSet<String>>,
}

impl ManagerInner {
    fn is_revoked(&self, refresh_token: &str) -> bool {
        self.revoked.lock().contains(refresh_token)
    }
}

/// Hands out valid access tokens for accounts.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers: Vec<_> = self.inner.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("TokenManager")
            .field("tiers", &tiers)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl TokenManager {
    /// Build a manager over `sources`, consulted in the given order.
    pub fn new(
        sources: Vec<Arc<dyn TokenSource>>,
        provider: Arc<dyn OAuthProvider>,
        clock: Arc<dyn Clock>,
        settings: TokenSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sources,
                provider,
                clock,
                settings,
                in_flight: SingleFlight::new(),
                revoked: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn settings(&self) -> TokenSettings {
        self.inner.settings
    }

    /// A currently valid access token, or `None` if the user has to
    /// re-authenticate.
    pub async fn valid_access_token(&self, account: &Account) -> Option<String> {
        self.resolve(account).await.map(|(token, _)| token)
    }

    /// Which tier can serve the account right now.
    ///
    /// This goes through the same path as [`Self::valid_access_token`], so
    /// it may refresh.
    pub async fn access_status(&self, account: &Account) -> AccessStatus {
        match self.resolve(account).await {
            Some((_, tier)) => AccessStatus::Valid { tier },
            None => AccessStatus::NeedsReauth,
        }
    }

    /// Refresh the primary tier's credential regardless of its expiry.
    pub async fn refresh_now(&self, account: &Account) -> ForcedRefresh {
        let Some(source) = self.inner.sources.first() else {
            return ForcedRefresh::NoCredential;
        };

        match self.flight(source, account, true).await {
            Flight::Refreshed(credential) => ForcedRefresh::Refreshed {
                expires_at: credential.expires_at,
            },
            Flight::Current(_) => ForcedRefresh::Failed {
                reason: "credential changed during refresh".to_string(),
            },
            Flight::NoCredential => ForcedRefresh::NoCredential,
            Flight::NoRefreshToken => ForcedRefresh::NoRefreshToken,
            Flight::Revoked => ForcedRefresh::Revoked,
            Flight::Transient(reason) => ForcedRefresh::Failed { reason },
        }
    }

    async fn resolve(&self, account: &Account) -> Option<(String, &'static str)> {
        for source in &self.inner.sources {
            if let Some(token) = self.from_tier(source, account).await {
                debug!(
                    "Serving token for account {} from {} tier",
                    account.external_id,
                    source.name()
                );
                return Some((token, source.name()));
            }
        }

        info!(
            "No valid token for account {}; re-authentication needed",
            account.external_id
        );
        None
    }

    async fn from_tier(
        &self,
        source: &Arc<dyn TokenSource>,
        account: &Account,
    ) -> Option<String> {
        let credential = match source.load(account).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!(
                    "No usable credential for account {} in {} tier",
                    account.external_id,
                    source.name()
                );
                return None;
            }
            Err(e) => {
                warn!(
                    "Failed to load credential for account {} from {} tier: {}",
                    account.external_id,
                    source.name(),
                    e
                );
                return None;
            }
        };

        let now = self.inner.clock.now();
        if credential.is_fresh(now, self.inner.settings.safety_margin_secs) {
            return Some(credential.access_token);
        }

        let Some(refresh_token) = credential.refresh_token else {
            debug!(
                "Credential for account {} in {} tier is expiring and has no refresh token",
                account.external_id,
                source.name()
            );
            return None;
        };
        if self.inner.is_revoked(&refresh_token) {
            debug!(
                "Skipping {} tier for account {}: refresh token already revoked",
                source.name(),
                account.external_id
            );
            return None;
        }

        match self.flight(source, account, false).await {
            Flight::Current(token) => Some(token),
            Flight::Refreshed(credential) => Some(credential.access_token),
            Flight::Revoked
            | Flight::NoCredential
            | Flight::NoRefreshToken
            | Flight::Transient(_) => None,
        }
    }

    /// Join or lead the refresh for this account.
    ///
    /// A caller that joins a flight led from another tier takes its outcome
    /// as its own: a token is valid whichever tier produced it.
    async fn flight(
        &self,
        source: &Arc<dyn TokenSource>,
        account: &Account,
        force: bool,
    ) -> Flight {
        let inner = self.inner.clone();
        let source = source.clone();
        let account = account.clone();
        self.inner
            .in_flight
            .run(account.external_id, move || {
                refresh_tier(inner, source, account, force).boxed()
            })
            .await
    }
}

/// Re-read the tier's credential and refresh it if it is still stale.
async fn refresh_tier(
    inner: Arc<ManagerInner>,
    source: Arc<dyn TokenSource>,
    account: Account,
    force: bool,
) -> Flight {
    let credential = match source.load(&account).await {
        Ok(Some(credential)) => credential,
        Ok(None) => return Flight::NoCredential,
        Err(e) => {
            warn!(
                "Failed to re-read credential for account {} from {} tier: {}",
                account.external_id,
                source.name(),
                e
            );
            return Flight::NoCredential;
        }
    };

    if !force && credential.is_fresh(inner.clock.now(), inner.settings.safety_margin_secs) {
        debug!(
            "Credential for account {} was refreshed concurrently",
            account.external_id
        );
        return Flight::Current(credential.access_token);
    }

    let Some(refresh_token) = credential.refresh_token else {
        return Flight::NoRefreshToken;
    };
    if inner.is_revoked(&refresh_token) {
        return Flight::Revoked;
    }

    info!(
        "Refreshing token for account {} ({} tier, expires at {:?})",
        account.external_id,
        source.name(),
        credential.expires_at
    );

    match inner.provider.refresh(&refresh_token).await {
        Ok(mut refreshed) => {
            if refreshed.refresh_token.is_none() {
                refreshed.refresh_token = Some(refresh_token);
            }

            if source.writes_back() {
                match source.store(&account, &refreshed).await {
                    Ok(true) => info!(
                        "Stored refreshed token for account {}, expires at {:?}",
                        account.external_id, refreshed.expires_at
                    ),
                    Ok(false) => warn!(
                        "Account {} disappeared before its refreshed token could be stored",
                        account.external_id
                    ),
                    Err(e) => warn!(
                        "Refreshed token for account {} could not be stored: {}",
                        account.external_id, e
                    ),
                }
            }
            Flight::Refreshed(refreshed)
        }
        Err(e) if e.is_revocation() => {
            warn!(
                "Refresh token for account {} was revoked ({} tier): {}",
                account.external_id,
                source.name(),
                e
            );
            inner.revoked.lock().insert(refresh_token.clone());
            match source.discard(&account, &refresh_token).await {
                Ok(true) => info!(
                    "Dropped revoked credential for account {} from {} tier",
                    account.external_id,
                    source.name()
                ),
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to drop revoked credential for account {}: {}",
                    account.external_id, e
                ),
            }
            if inner.settings.revocation_policy == RevocationPolicy::Deactivate {
                match source.mark_revoked(&account).await {
                    Ok(true) => info!(
                        "Deactivated account {} in {} tier after revocation",
                        account.external_id,
                        source.name()
                    ),
                    Ok(false) => debug!(
                        "Account {} not present in {} tier to deactivate",
                        account.external_id,
                        source.name()
                    ),
                    Err(e) => warn!(
                        "Failed to deactivate account {} after revocation: {}",
                        account.external_id, e
                    ),
                }
            }
            Flight::Revoked
        }
        Err(e) => {
            warn!(
                "Token refresh for account {} failed, will retry on next use: {}",
                account.external_id, e
            );
            Flight::Transient(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CredentialCipher, EncryptionKey};
    use crate::clock::ManualClock;
    use crate::db::MemberStore;
    use crate::provider::RefreshError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const NOW: i64 = 1_700_000_000;

    /// Provider that replays scripted answers and records each call.
    #[derive(Default)]
    struct ScriptedProvider {
        answers: Mutex<VecDeque<Result<Credential, RefreshError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn answering(answers: Vec<Result<Credential, RefreshError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl OAuthProvider for ScriptedProvider {
        async fn refresh(&self, refresh_token: &str) -> Result<Credential, RefreshError> {
            self.calls.lock().push(refresh_token.to_string());
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(RefreshError::transport("no scripted answer")))
        }
    }

    fn credential(access: &str, refresh: Option<&str>, expires_at: Option<i64>) -> Credential {
        Credential {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at,
            token_type: "Bearer".to_string(),
        }
    }

    async fn setup(
        stored: Credential,
        provider: Arc<ScriptedProvider>,
        settings: TokenSettings,
    ) -> (MemberStore, Account, TokenManager, Arc<ManualClock>) {
        let cipher = CredentialCipher::new(Some(EncryptionKey::from_bytes([4u8; 32])));
        let members = MemberStore::open_in_memory(cipher).await.unwrap();
        let account = members
            .register("d1", 555, &serde_json::json!({"id": 555}), &stored)
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let manager = TokenManager::new(
            vec![Arc::new(DurableSource::new(members.clone())) as Arc<dyn TokenSource>],
            provider,
            clock.clone(),
            settings,
        );
        (members, account, manager, clock)
    }

    #[tokio::test]
    async fn test_safety_margin_boundary() {
        let provider = ScriptedProvider::answering(vec![Ok(credential(
            "a2",
            Some("r2"),
            Some(NOW + 7200),
        ))]);
        let (members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), Some(NOW + 3601)),
            provider.clone(),
            TokenSettings::default(),
        )
        .await;

        assert_eq!(manager.valid_access_token(&account).await.as_deref(), Some("a1"));
        assert!(provider.calls().is_empty());

        members
            .update_credential(555, &credential("a1", Some("r1"), Some(NOW + 3599)))
            .await
            .unwrap();
        assert_eq!(manager.valid_access_token(&account).await.as_deref(), Some("a2"));
        assert_eq!(provider.calls(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_expiry_is_refreshed() {
        let provider =
            ScriptedProvider::answering(vec![Ok(credential("a2", None, Some(NOW + 7200)))]);
        let (members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), None),
            provider.clone(),
            TokenSettings::default(),
        )
        .await;

        assert_eq!(manager.valid_access_token(&account).await.as_deref(), Some("a2"));

        // The provider sent no new refresh token, so the old one is kept.
        let stored = members.load_credential(555).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("r1"));
        assert_eq!(stored.expires_at, Some(NOW + 7200));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token() {
        let provider = ScriptedProvider::answering(vec![]);
        let (_members, account, manager, _clock) = setup(
            credential("a1", None, Some(NOW - 10)),
            provider.clone(),
            TokenSettings::default(),
        )
        .await;

        assert_eq!(manager.valid_access_token(&account).await, None);
        assert_eq!(manager.access_status(&account).await, AccessStatus::NeedsReauth);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_keep_active_policy() {
        let provider = ScriptedProvider::answering(vec![Err(RefreshError {
            status: Some(400),
            code: Some("invalid_grant".to_string()),
            message: "revoked".to_string(),
        })]);
        let (members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), Some(NOW - 10)),
            provider.clone(),
            TokenSettings {
                revocation_policy: RevocationPolicy::KeepActive,
                ..TokenSettings::default()
            },
        )
        .await;

        assert_eq!(manager.valid_access_token(&account).await, None);
        assert_eq!(manager.valid_access_token(&account).await, None);
        assert_eq!(provider.calls(), vec!["r1".to_string()]);

        let stored = members.get_by_external_id(555).await.unwrap().unwrap();
        assert!(stored.is_active);
        assert!(stored.encrypted_credential.is_none());
    }

    #[tokio::test]
    async fn test_revoked_token_is_sent_once() {
        let revoked = || {
            Err(RefreshError {
                status: Some(401),
                code: None,
                message: "Unauthorized".to_string(),
            })
        };
        let provider = ScriptedProvider::answering(vec![revoked(), revoked(), revoked()]);
        let (members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), Some(NOW - 10)),
            provider.clone(),
            TokenSettings::default(),
        )
        .await;

        for _ in 0..3 {
            assert_eq!(manager.valid_access_token(&account).await, None);
        }
        assert_eq!(provider.calls(), vec!["r1".to_string()]);
        assert_eq!(manager.refresh_now(&account).await, ForcedRefresh::NoCredential);

        let stored = members.get_by_external_id(555).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(stored.encrypted_credential.is_none());
    }

    #[tokio::test]
    async fn test_reauthenticated_credential_is_used_after_revocation() {
        let provider = ScriptedProvider::answering(vec![Err(RefreshError {
            status: Some(401),
            code: None,
            message: "Unauthorized".to_string(),
        })]);
        let (members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), Some(NOW - 10)),
            provider.clone(),
            TokenSettings {
                revocation_policy: RevocationPolicy::KeepActive,
                ..TokenSettings::default()
            },
        )
        .await;

        assert_eq!(manager.valid_access_token(&account).await, None);

        members
            .update_credential(555, &credential("b1", Some("r2"), Some(NOW + 7200)))
            .await
            .unwrap();
        assert_eq!(manager.valid_access_token(&account).await.as_deref(), Some("b1"));
        assert_eq!(provider.calls(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_now_ignores_expiry() {
        let provider = ScriptedProvider::answering(vec![Ok(credential(
            "a2",
            Some("r2"),
            Some(NOW + 90_000),
        ))]);
        let (members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), Some(NOW + 80_000)),
            provider.clone(),
            TokenSettings::default(),
        )
        .await;

        assert_eq!(
            manager.refresh_now(&account).await,
            ForcedRefresh::Refreshed {
                expires_at: Some(NOW + 90_000)
            }
        );
        assert_eq!(provider.calls(), vec!["r1".to_string()]);
        let stored = members.load_credential(555).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "a2");
        assert_eq!(stored.refresh_token.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_refresh_now_reports_failures() {
        let provider = ScriptedProvider::answering(vec![Err(RefreshError {
            status: Some(503),
            code: None,
            message: "unavailable".to_string(),
        })]);
        let (_members, account, manager, _clock) = setup(
            credential("a1", Some("r1"), Some(NOW + 80_000)),
            provider,
            TokenSettings::default(),
        )
        .await;

        assert!(matches!(
            manager.refresh_now(&account).await,
            ForcedRefresh::Failed { .. }
        ));
        // Still usable: the stored token was not touched.
        assert_eq!(manager.valid_access_token(&account).await.as_deref(), Some("a1"));
    }

    #[test]
    fn test_revocation_policy_names() {
        let policy: RevocationPolicy = serde_json::from_str("\"keep_active\"").unwrap();
        assert_eq!(policy, RevocationPolicy::KeepActive);
        assert_eq!(RevocationPolicy::default(), RevocationPolicy::Deactivate);
    }
}
