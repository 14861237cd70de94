//! End-to-end token lifecycle over the durable and legacy tiers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use roster_auth::{
    AccessStatus, Account, Credential, CredentialCipher, DurableSource, EncryptionKey,
    FileSnapshotPersister, LegacySource, LegacyStore, ManualClock, MemberStore, OAuthProvider,
    RefreshError, TokenManager, TokenSettings, TokenSource,
};

const NOW: i64 = 1_700_000_000;

/// Provider that takes a while to answer, so concurrent callers overlap.
struct SlowProvider {
    answers: Mutex<VecDeque<Result<Credential, RefreshError>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl SlowProvider {
    fn new(answers: Vec<Result<Credential, RefreshError>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::from_millis(50),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl OAuthProvider for SlowProvider {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, RefreshError> {
        self.calls.lock().push(refresh_token.to_string());
        tokio::time::sleep(self.delay).await;
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

fn revoked() -> RefreshError {
    RefreshError {
        status: Some(401),
        code: None,
        message: "Unauthorized".to_string(),
    }
}

fn unavailable() -> RefreshError {
    RefreshError {
        status: Some(503),
        code: None,
        message: "Service Unavailable".to_string(),
    }
}

fn cipher() -> CredentialCipher {
    CredentialCipher::new(Some(EncryptionKey::from_bytes([21u8; 32])))
}

struct Harness {
    _dir: tempfile::TempDir,
    members: MemberStore,
    legacy: Arc<LegacyStore>,
    clock: Arc<ManualClock>,
    provider: Arc<SlowProvider>,
    manager: TokenManager,
}

async fn harness(answers: Vec<Result<Credential, RefreshError>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let members = MemberStore::open_in_memory(cipher()).await.unwrap();
    let legacy = Arc::new(
        LegacyStore::load(
            Arc::new(FileSnapshotPersister::new(dir.path().join("users.json"))),
            cipher(),
        )
        .await
        .unwrap(),
    );
    let clock = Arc::new(ManualClock::new(NOW));
    let provider = SlowProvider::new(answers);

    let sources: Vec<Arc<dyn TokenSource>> = vec![
        Arc::new(DurableSource::new(members.clone())),
        Arc::new(LegacySource::new(legacy.clone())),
    ];
    let manager = TokenManager::new(
        sources,
        provider.clone(),
        clock.clone(),
        TokenSettings::default(),
    );

    Harness {
        _dir: dir,
        members,
        legacy,
        clock,
        provider,
        manager,
    }
}

/// An account that exists in the member store without a usable credential.
async fn import_without_credential(
    members: &MemberStore,
    sealed_with: Option<CredentialCipher>,
) -> Account {
    let account = Account {
        external_id: 555,
        local_id: "d1".to_string(),
        is_active: true,
        profile: json!({"id": 555}),
        encrypted_credential: sealed_with
            .and_then(|other| other.encrypt(&credential("stale", Some("r0"), Some(NOW + 9999)))),
        registered_at: Utc::now(),
        updated_at: Utc::now(),
    };
    assert!(members.import_account(&account).await.unwrap());
    members.get_by_external_id(555).await.unwrap().unwrap()
}

#[tokio::test]
async fn cached_then_single_refresh_under_concurrency() {
    let h = harness(vec![Ok(credential("a2", Some("r2"), Some(NOW + 7200 + 21600)))]).await;
    let account = h
        .members
        .register("d1", 555, &json!({"id": 555}), &credential("a1", Some("r1"), Some(NOW + 7200)))
        .await
        .unwrap();

    assert_eq!(h.manager.valid_access_token(&account).await.as_deref(), Some("a1"));
    assert!(h.provider.calls().is_empty());

    h.clock.advance(7201);

    let (first, second) = tokio::join!(
        h.manager.valid_access_token(&account),
        h.manager.valid_access_token(&account),
    );
    assert_eq!(first.as_deref(), Some("a2"));
    assert_eq!(second.as_deref(), Some("a2"));
    assert_eq!(h.provider.calls(), vec!["r1".to_string()]);

    let stored = h.members.load_credential(555).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "a2");
    assert_eq!(stored.refresh_token.as_deref(), Some("r2"));

    // Persisted, so the next call is served from storage.
    assert_eq!(h.manager.valid_access_token(&account).await.as_deref(), Some("a2"));
    assert_eq!(h.provider.calls().len(), 1);
}

#[tokio::test]
async fn revoked_token_deactivates_and_is_not_retried() {
    let h = harness(vec![Err(revoked())]).await;
    let account = h
        .members
        .register("d1", 555, &json!({"id": 555}), &credential("a1", Some("r1"), Some(NOW - 1)))
        .await
        .unwrap();
    h.legacy
        .register("d1", 555, &json!({"id": 555}), &credential("la1", Some("r1"), Some(NOW - 1)))
        .await
        .unwrap();

    assert_eq!(h.manager.valid_access_token(&account).await, None);
    assert_eq!(h.provider.calls(), vec!["r1".to_string()]);

    let stored = h.members.get_by_external_id(555).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert!(h.legacy.get_by_external_id(555).unwrap().is_active);
}

#[tokio::test]
async fn transient_failure_is_retried_on_next_call() {
    let h = harness(vec![
        Err(unavailable()),
        Ok(credential("a2", None, Some(NOW + 7200))),
    ])
    .await;
    let account = h
        .members
        .register("d1", 555, &json!({"id": 555}), &credential("a1", Some("r1"), Some(NOW + 60)))
        .await
        .unwrap();

    assert_eq!(h.manager.valid_access_token(&account).await, None);
    assert!(h.members.get_by_external_id(555).await.unwrap().unwrap().is_active);

    assert_eq!(h.manager.valid_access_token(&account).await.as_deref(), Some("a2"));
    assert_eq!(h.provider.calls(), vec!["r1".to_string(), "r1".to_string()]);
}

#[tokio::test]
async fn legacy_fallback_refreshes_without_writing_back() {
    let h = harness(vec![
        Ok(credential("la2", Some("lr2"), Some(NOW + 7200))),
        Ok(credential("la3", Some("lr3"), Some(NOW + 7200))),
    ])
    .await;
    let account = import_without_credential(&h.members, None).await;
    h.legacy
        .register("d1", 555, &json!({"id": 555}), &credential("la1", Some("lr1"), Some(NOW - 5)))
        .await
        .unwrap();

    assert_eq!(h.manager.valid_access_token(&account).await.as_deref(), Some("la2"));
    assert_eq!(h.provider.calls(), vec!["lr1".to_string()]);

    // Neither tier was updated.
    assert_eq!(h.legacy.load_credential("d1").unwrap().access_token, "la1");
    assert!(h.members.load_credential(555).await.unwrap().is_none());

    assert_eq!(
        h.manager.access_status(&account).await,
        AccessStatus::Valid { tier: "legacy" }
    );
    assert_eq!(h.provider.calls().len(), 2);
}

#[tokio::test]
async fn undecryptable_durable_credential_falls_through() {
    let h = harness(vec![]).await;
    let other_key = CredentialCipher::new(Some(EncryptionKey::from_bytes([99u8; 32])));
    let account = import_without_credential(&h.members, Some(other_key)).await;
    assert!(account.encrypted_credential.is_some());

    h.legacy
        .register("d1", 555, &json!({"id": 555}), &credential("la1", Some("lr1"), Some(NOW + 7200)))
        .await
        .unwrap();

    assert_eq!(h.manager.valid_access_token(&account).await.as_deref(), Some("la1"));
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn no_tier_has_a_token() {
    let h = harness(vec![]).await;
    let account = import_without_credential(&h.members, None).await;

    assert_eq!(h.manager.valid_access_token(&account).await, None);
    assert_eq!(h.manager.access_status(&account).await, AccessStatus::NeedsReauth);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn revoked_token_shared_by_both_tiers_is_sent_once() {
    let h = harness(vec![Err(revoked()), Err(revoked())]).await;
    let account = h
        .members
        .register("d1", 555, &json!({"id": 555}), &credential("a1", Some("r1"), Some(NOW - 1)))
        .await
        .unwrap();
    h.legacy
        .register("d1", 555, &json!({"id": 555}), &credential("la1", Some("r1"), Some(NOW - 1)))
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(h.manager.valid_access_token(&account).await, None);
    }
    assert_eq!(h.provider.calls(), vec!["r1".to_string()]);
    assert!(h.members.load_credential(555).await.unwrap().is_none());
}

#[tokio::test]
async fn legacy_entry_linked_to_another_account_is_ignored() {
    let h = harness(vec![Err(revoked())]).await;
    let account = import_without_credential(&h.members, None).await;
    h.legacy
        .register(
            "d1",
            777,
            &json!({"id": 777}),
            &credential("token-of-777", Some("r7"), Some(NOW + 7200)),
        )
        .await
        .unwrap();

    assert_eq!(h.manager.valid_access_token(&account).await, None);
    assert_eq!(h.manager.access_status(&account).await, AccessStatus::NeedsReauth);

    // Expired, so a refresh would be attempted if the entry were used.
    h.clock.advance(7200);
    assert_eq!(h.manager.valid_access_token(&account).await, None);
    assert!(h.provider.calls().is_empty());

    let tier = LegacySource::new(h.legacy.clone());
    assert!(tier.load(&account).await.unwrap().is_none());
    assert!(!tier.mark_revoked(&account).await.unwrap());
    assert!(h.legacy.get_by_external_id(777).unwrap().is_active);
}
