//! Dual-index legacy registry.
//!
//! Entries are indexed by external id (authoritative) and, for active
//! entries, by local id. Every mutation is staged on a copy of the committed
//! indexes, the whole staged collection is persisted, and only then is the
//! copy committed. A failed write discards the staged copy, so callers never
//! observe a half-applied mutation. Mutations queue on one async mutex.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::snapshot::{LegacyEntry, LegacySnapshot, SnapshotPersister};
use crate::cipher::CredentialCipher;
use crate::error::{AuthError, AuthResult, ConflictKind};
use crate::models::{validate_identity, Credential};

/// The two indexes over legacy entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyIndexes {
    by_external_id: BTreeMap<i64, LegacyEntry>,
    by_local_id: BTreeMap<String, i64>,
}

/// A broken link between the two indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyViolation {
    /// An active entry has no local-id index entry.
    MissingLocalIndex { external_id: i64, local_id: String },
    /// The local-id index points an active entry's local id elsewhere.
    MisdirectedLocalIndex {
        local_id: String,
        expected: i64,
        found: i64,
    },
    /// A local-id index entry points at no account.
    OrphanLocalIndex { local_id: String, external_id: i64 },
    /// A local-id index entry points at an inactive account.
    InactiveLocalIndex { local_id: String, external_id: i64 },
    /// A local-id index entry points at an account with a different local id.
    StaleLocalIndex {
        local_id: String,
        external_id: i64,
        actual_local_id: String,
    },
}

/// Whether a staged mutation changed anything worth persisting.
enum Staged<R> {
    Changed(R),
    Unchanged(R),
}

impl LegacyIndexes {
    /// Build indexes from raw records, first occurrence wins.
    ///
    /// Returns the indexes and how many records were dropped as invalid or
    /// duplicate.
    fn from_records(records: Vec<serde_json::Value>) -> (Self, usize) {
        let mut indexes = Self::default();
        let mut dropped = 0;

        for (position, record) in records.into_iter().enumerate() {
            let entry = match LegacyEntry::from_value(record) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Dropping legacy record #{}: {}", position, e);
                    dropped += 1;
                    continue;
                }
            };

            if indexes.by_external_id.contains_key(&entry.external_id) {
                warn!(
                    "Dropping duplicate legacy record #{} for external id {}",
                    position, entry.external_id
                );
                dropped += 1;
                continue;
            }

            if entry.is_active {
                if let Some(holder) = indexes.by_local_id.get(&entry.local_id) {
                    warn!(
                        "Dropping legacy record #{}: local id {} already belongs to {}",
                        position, entry.local_id, holder
                    );
                    dropped += 1;
                    continue;
                }
                indexes
                    .by_local_id
                    .insert(entry.local_id.clone(), entry.external_id);
            }

            indexes.by_external_id.insert(entry.external_id, entry);
        }

        (indexes, dropped)
    }

    fn to_snapshot(&self) -> LegacySnapshot {
        LegacySnapshot {
            saved_at: Utc::now(),
            accounts: self.by_external_id.values().cloned().collect(),
        }
    }

    fn register(&mut self, entry: LegacyEntry) -> AuthResult<LegacyEntry> {
        let previous = self.by_external_id.get(&entry.external_id);
        if previous.is_some_and(|p| p.is_active) {
            return Err(AuthError::conflict(
                ConflictKind::DuplicateActiveExternalId,
                entry.external_id.to_string(),
            ));
        }
        if let Some(&holder) = self.by_local_id.get(&entry.local_id) {
            if holder != entry.external_id {
                return Err(AuthError::conflict(
                    ConflictKind::DuplicateLocalId,
                    entry.local_id.clone(),
                ));
            }
        }

        let entry = LegacyEntry {
            registered_at: previous.map_or(entry.registered_at, |p| p.registered_at),
            ..entry
        };
        self.by_local_id
            .insert(entry.local_id.clone(), entry.external_id);
        self.by_external_id.insert(entry.external_id, entry.clone());
        Ok(entry)
    }

    fn remove(&mut self, external_id: i64) -> Staged<Option<LegacyEntry>> {
        let Some(entry) = self.by_external_id.remove(&external_id) else {
            return Staged::Unchanged(None);
        };
        self.unlink_local(&entry);
        Staged::Changed(Some(entry))
    }

    fn deactivate(&mut self, external_id: i64) -> Staged<bool> {
        let Some(entry) = self.by_external_id.get_mut(&external_id) else {
            return Staged::Unchanged(false);
        };
        if !entry.is_active {
            return Staged::Unchanged(true);
        }
        entry.is_active = false;
        let entry = entry.clone();
        self.unlink_local(&entry);
        Staged::Changed(true)
    }

    fn reactivate(&mut self, external_id: i64) -> AuthResult<Staged<bool>> {
        let Some(entry) = self.by_external_id.get(&external_id) else {
            return Ok(Staged::Unchanged(false));
        };
        if entry.is_active {
            return Ok(Staged::Unchanged(true));
        }
        if let Some(&holder) = self.by_local_id.get(&entry.local_id) {
            if holder != external_id {
                return Err(AuthError::conflict(
                    ConflictKind::DuplicateLocalId,
                    entry.local_id.clone(),
                ));
            }
        }

        let local_id = entry.local_id.clone();
        if let Some(entry) = self.by_external_id.get_mut(&external_id) {
            entry.is_active = true;
        }
        self.by_local_id.insert(local_id, external_id);
        Ok(Staged::Changed(true))
    }

    fn unlink_local(&mut self, entry: &LegacyEntry) {
        if self.by_local_id.get(&entry.local_id) == Some(&entry.external_id) {
            self.by_local_id.remove(&entry.local_id);
        }
    }

    fn verify(&self) -> Vec<ConsistencyViolation> {
        let mut violations = Vec::new();

        for entry in self.by_external_id.values().filter(|e| e.is_active) {
            match self.by_local_id.get(&entry.local_id) {
                None => violations.push(ConsistencyViolation::MissingLocalIndex {
                    external_id: entry.external_id,
                    local_id: entry.local_id.clone(),
                }),
                Some(&found) if found != entry.external_id => {
                    violations.push(ConsistencyViolation::MisdirectedLocalIndex {
                        local_id: entry.local_id.clone(),
                        expected: entry.external_id,
                        found,
                    })
                }
                Some(_) => {}
            }
        }

        for (local_id, &external_id) in &self.by_local_id {
            match self.by_external_id.get(&external_id) {
                None => violations.push(ConsistencyViolation::OrphanLocalIndex {
                    local_id: local_id.clone(),
                    external_id,
                }),
                Some(entry) if !entry.is_active => {
                    violations.push(ConsistencyViolation::InactiveLocalIndex {
                        local_id: local_id.clone(),
                        external_id,
                    })
                }
                Some(entry) if entry.local_id != *local_id => {
                    violations.push(ConsistencyViolation::StaleLocalIndex {
                        local_id: local_id.clone(),
                        external_id,
                        actual_local_id: entry.local_id.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        violations
    }
}

/// The legacy file-backed registry.
pub struct LegacyStore {
    committed: RwLock<LegacyIndexes>,
    write_queue: tokio::sync::Mutex<()>,
    persister: Arc<dyn SnapshotPersister>,
    cipher: CredentialCipher,
}

impl std::fmt::Debug for LegacyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyStore")
            .field("location", &self.persister.location())
            .field("entries", &self.committed.read().by_external_id.len())
            .finish()
    }
}

impl LegacyStore {
    /// Load the registry from its snapshot.
    ///
    /// Invalid and duplicate records are dropped (first occurrence wins) and
    /// the cleaned snapshot is written back straight away.
    pub async fn load(
        persister: Arc<dyn SnapshotPersister>,
        cipher: CredentialCipher,
    ) -> AuthResult<Self> {
        let records = persister
            .load()
            .await?
            .map(|snapshot| snapshot.accounts)
            .unwrap_or_default();
        let total = records.len();

        let (indexes, dropped) = LegacyIndexes::from_records(records);

        if dropped > 0 {
            warn!(
                "Dropped {} of {} legacy records from {}; re-saving cleaned snapshot",
                dropped,
                total,
                persister.location()
            );
            persister.save(&indexes.to_snapshot()).await?;
        }

        info!(
            "Loaded {} legacy accounts from {}",
            indexes.by_external_id.len(),
            persister.location()
        );

        Ok(Self {
            committed: RwLock::new(indexes),
            write_queue: tokio::sync::Mutex::new(()),
            persister,
            cipher,
        })
    }

    /// Stage a mutation, persist it, and commit it.
    async fn mutate<R>(
        &self,
        operation: &str,
        apply: impl FnOnce(&mut LegacyIndexes) -> AuthResult<Staged<R>>,
    ) -> AuthResult<R> {
        let _queued = self.write_queue.lock().await;

        let mut staged = self.committed.read().clone();
        let result = match apply(&mut staged)? {
            Staged::Unchanged(result) => return Ok(result),
            Staged::Changed(result) => result,
        };

        if let Err(e) = self.persister.save(&staged.to_snapshot()).await {
            warn!("Legacy {} rolled back: {}", operation, e);
            return Err(e);
        }

        *self.committed.write() = staged;
        debug!("Legacy {} committed", operation);
        Ok(result)
    }

    /// Register an account, or re-register an inactive one.
    pub async fn register(
        &self,
        local_id: &str,
        external_id: i64,
        profile: &serde_json::Value,
        credential: &Credential,
    ) -> AuthResult<LegacyEntry> {
        validate_identity(local_id, external_id)?;

        let entry = LegacyEntry {
            external_id,
            local_id: local_id.to_string(),
            profile: profile.clone(),
            credential: self.cipher.encrypt(credential),
            is_active: true,
            registered_at: Utc::now(),
        };
        if entry.credential.is_none() {
            warn!(
                "Legacy registration of {} has no stored credential: encryption is not configured",
                external_id
            );
        }

        self.mutate("register", |indexes| indexes.register(entry).map(Staged::Changed))
            .await
    }

    /// Remove an account. Returns the removed entry.
    pub async fn remove(&self, external_id: i64) -> AuthResult<Option<LegacyEntry>> {
        self.mutate("remove", |indexes| Ok(indexes.remove(external_id)))
            .await
    }

    /// Deactivate an account. Returns `false` if no account matched.
    pub async fn deactivate(&self, external_id: i64) -> AuthResult<bool> {
        self.mutate("deactivate", |indexes| Ok(indexes.deactivate(external_id)))
            .await
    }

    /// Reactivate an account. Returns `false` if no account matched.
    pub async fn reactivate(&self, external_id: i64) -> AuthResult<bool> {
        self.mutate("reactivate", |indexes| indexes.reactivate(external_id))
            .await
    }

    pub fn get_by_external_id(&self, external_id: i64) -> Option<LegacyEntry> {
        self.committed.read().by_external_id.get(&external_id).cloned()
    }

    /// The active entry for a local id.
    pub fn get_by_local_id(&self, local_id: &str) -> Option<LegacyEntry> {
        let indexes = self.committed.read();
        let external_id = indexes.by_local_id.get(local_id)?;
        indexes.by_external_id.get(external_id).cloned()
    }

    /// Decrypt the credential of the active entry for a local id.
    pub fn load_credential(&self, local_id: &str) -> Option<Credential> {
        let entry = self.get_by_local_id(local_id)?;
        self.decrypt_credential(&entry)
    }

    /// Decrypt an entry's credential with the registry's key.
    pub fn decrypt_credential(&self, entry: &LegacyEntry) -> Option<Credential> {
        self.cipher.decrypt(entry.credential.as_ref()?)
    }

    /// All entries, ordered by external id.
    pub fn entries(&self) -> Vec<LegacyEntry> {
        self.committed.read().by_external_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.committed.read().by_external_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the committed indexes.
    pub fn indexes(&self) -> LegacyIndexes {
        self.committed.read().clone()
    }

    /// Check both indexes against each other.
    pub fn verify_consistency(&self) -> Vec<ConsistencyViolation> {
        self.committed.read().verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::EncryptionKey;
    use crate::legacy::snapshot::{FileSnapshotPersister, RawSnapshot};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory persister that can be told to fail.
    #[derive(Default)]
    struct FlakyPersister {
        initial: Option<Vec<serde_json::Value>>,
        fail: AtomicBool,
        saves: AtomicUsize,
        last: parking_lot::Mutex<Option<LegacySnapshot>>,
    }

    #[async_trait]
    impl SnapshotPersister for FlakyPersister {
        async fn load(&self) -> AuthResult<Option<RawSnapshot>> {
            Ok(self.initial.clone().map(|accounts| RawSnapshot {
                version: Some(1),
                saved_at: None,
                accounts,
            }))
        }

        async fn save(&self, snapshot: &LegacySnapshot) -> AuthResult<()> {
            tokio::task::yield_now().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuthError::Persistence {
                    path: "memory".to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(snapshot.clone());
            Ok(())
        }

        fn location(&self) -> String {
            "memory".to_string()
        }
    }

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(Some(EncryptionKey::from_bytes([5u8; 32])))
    }

    fn credential(access: &str) -> Credential {
        Credential {
            access_token: access.to_string(),
            refresh_token: Some("r".to_string()),
            expires_at: Some(Utc::now().timestamp() + 7200),
            token_type: "Bearer".to_string(),
        }
    }

    async fn store_with(persister: Arc<FlakyPersister>) -> LegacyStore {
        LegacyStore::load(persister, cipher()).await.unwrap()
    }

    #[tokio::test]
    async fn test_operation_sequence_stays_consistent() {
        let persister = Arc::new(FlakyPersister::default());
        let store = store_with(persister.clone()).await;

        store.register("d1", 1, &json!({}), &credential("a")).await.unwrap();
        store.register("d2", 2, &json!({}), &credential("b")).await.unwrap();
        store.register("d3", 3, &json!({}), &credential("c")).await.unwrap();
        assert!(store.verify_consistency().is_empty());

        assert!(store.deactivate(2).await.unwrap());
        assert!(store.verify_consistency().is_empty());
        assert!(store.get_by_local_id("d2").is_none());

        // d2 is free once its holder is inactive.
        store.register("d2", 4, &json!({}), &credential("d")).await.unwrap();
        assert!(store.verify_consistency().is_empty());

        let err = store.reactivate(2).await.unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::DuplicateLocalId));
        assert!(store.verify_consistency().is_empty());

        assert!(store.remove(4).await.unwrap().is_some());
        assert!(store.reactivate(2).await.unwrap());
        assert!(store.verify_consistency().is_empty());
        assert_eq!(store.get_by_local_id("d2").unwrap().external_id, 2);

        assert!(store.remove(1).await.unwrap().is_some());
        assert!(store.remove(1).await.unwrap().is_none());
        assert!(!store.deactivate(99).await.unwrap());
        assert!(!store.reactivate(99).await.unwrap());
        assert!(store.verify_consistency().is_empty());
        assert_eq!(store.len(), 2);

        // Every committed mutation wrote a snapshot matching memory.
        let last = persister.last.lock().clone().unwrap();
        assert_eq!(last.accounts, store.entries());
    }

    #[tokio::test]
    async fn test_register_conflicts() {
        let store = store_with(Arc::new(FlakyPersister::default())).await;
        store.register("d1", 1, &json!({}), &credential("a")).await.unwrap();

        let err = store
            .register("d9", 1, &json!({}), &credential("a"))
            .await
            .unwrap_err();
        assert_eq!(
            err.conflict_kind(),
            Some(ConflictKind::DuplicateActiveExternalId)
        );

        let err = store
            .register("d1", 2, &json!({}), &credential("a"))
            .await
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::DuplicateLocalId));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back_register() {
        let persister = Arc::new(FlakyPersister::default());
        let store = store_with(persister.clone()).await;
        store.register("d1", 1, &json!({}), &credential("a")).await.unwrap();
        store.deactivate(1).await.unwrap();

        let before = store.indexes();
        persister.fail.store(true, Ordering::SeqCst);

        let err = store
            .register("d2", 2, &json!({}), &credential("b"))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(store.indexes(), before);

        let err = store
            .register("d1", 1, &json!({}), &credential("c"))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(store.indexes(), before);

        assert!(store.reactivate(1).await.is_err());
        assert!(store.remove(1).await.is_err());
        assert_eq!(store.indexes(), before);
        assert!(store.verify_consistency().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_serialized() {
        let persister = Arc::new(FlakyPersister::default());
        let store = Arc::new(store_with(persister.clone()).await);

        let mut handles = Vec::new();
        for i in 1..=20_i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .register(&format!("d{i}"), i, &json!({}), &credential("a"))
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    store.deactivate(i).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 20);
        assert!(store.verify_consistency().is_empty());
        let last = persister.last.lock().clone().unwrap();
        assert_eq!(last.accounts, store.entries());
    }

    #[tokio::test]
    async fn test_load_drops_duplicates_first_wins() {
        let persister = Arc::new(FlakyPersister {
            initial: Some(vec![
                json!({"localId": "d1", "profile": {"id": 1}, "isActive": true}),
                json!({"localId": "d2", "profile": {"id": 1}, "isActive": true}),
                json!({"localId": "d1", "profile": {"id": 2}, "isActive": true}),
                json!({"localId": "d1", "profile": {"id": 3}, "isActive": false}),
                json!({"profile": {"id": 4}}),
            ]),
            ..Default::default()
        });
        let store = store_with(persister.clone()).await;

        assert_eq!(store.len(), 2);
        assert_eq!(store.get_by_local_id("d1").unwrap().external_id, 1);
        assert!(store.get_by_external_id(2).is_none());
        assert!(!store.get_by_external_id(3).unwrap().is_active);
        assert!(store.verify_consistency().is_empty());

        // Cleaned snapshot written back immediately.
        assert_eq!(persister.saves.load(Ordering::SeqCst), 1);
        assert_eq!(persister.last.lock().clone().unwrap().accounts.len(), 2);
    }

    #[tokio::test]
    async fn test_clean_load_does_not_rewrite() {
        let persister = Arc::new(FlakyPersister {
            initial: Some(vec![json!({"localId": "d1", "profile": {"id": 1}})]),
            ..Default::default()
        });
        let store = store_with(persister.clone()).await;
        assert_eq!(store.len(), 1);
        assert_eq!(persister.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_credential_lookup() {
        let store = store_with(Arc::new(FlakyPersister::default())).await;
        store.register("d1", 1, &json!({}), &credential("a1")).await.unwrap();

        assert_eq!(store.load_credential("d1").unwrap().access_token, "a1");
        assert!(store.load_credential("d2").is_none());

        store.deactivate(1).await.unwrap();
        assert!(store.load_credential("d1").is_none());
    }

    #[test]
    fn test_verify_reports_each_violation() {
        let entry = |external_id: i64, local_id: &str, is_active: bool| LegacyEntry {
            external_id,
            local_id: local_id.to_string(),
            profile: json!({}),
            credential: None,
            is_active,
            registered_at: Utc::now(),
        };

        let mut indexes = LegacyIndexes::default();
        indexes.by_external_id.insert(1, entry(1, "a", true));
        indexes.by_external_id.insert(2, entry(2, "b", true));
        indexes.by_external_id.insert(3, entry(3, "c", false));
        indexes.by_external_id.insert(4, entry(4, "d", true));
        indexes.by_local_id.insert("b".to_string(), 4);
        indexes.by_local_id.insert("c".to_string(), 3);
        indexes.by_local_id.insert("x".to_string(), 9);
        indexes.by_local_id.insert("d".to_string(), 4);

        let violations = indexes.verify();
        assert!(violations.contains(&ConsistencyViolation::MissingLocalIndex {
            external_id: 1,
            local_id: "a".to_string()
        }));
        assert!(violations.contains(&ConsistencyViolation::MisdirectedLocalIndex {
            local_id: "b".to_string(),
            expected: 2,
            found: 4
        }));
        assert!(violations.contains(&ConsistencyViolation::InactiveLocalIndex {
            local_id: "c".to_string(),
            external_id: 3
        }));
        assert!(violations.contains(&ConsistencyViolation::OrphanLocalIndex {
            local_id: "x".to_string(),
            external_id: 9
        }));
        assert!(violations.contains(&ConsistencyViolation::StaleLocalIndex {
            local_id: "b".to_string(),
            external_id: 4,
            actual_local_id: "d".to_string()
        }));
        assert_eq!(violations.len(), 5);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = LegacyStore::load(Arc::new(FileSnapshotPersister::new(&path)), cipher())
            .await
            .unwrap();
        store.register("d1", 1, &json!({"id": 1}), &credential("a1")).await.unwrap();
        store.register("d2", 2, &json!({"id": 2}), &credential("b1")).await.unwrap();
        store.deactivate(2).await.unwrap();

        let reloaded = LegacyStore::load(Arc::new(FileSnapshotPersister::new(&path)), cipher())
            .await
            .unwrap();
        assert_eq!(reloaded.indexes(), store.indexes());
        assert_eq!(reloaded.load_credential("d1").unwrap().access_token, "a1");
    }
}
