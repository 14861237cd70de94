//! Legacy snapshot file format and persistence.
//!
//! The legacy registry is saved as one JSON document holding every account.
//! Writes go to a sibling temp file which is then renamed over the snapshot,
//! so a crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cipher::EncryptedBlob;
use crate::error::{AuthError, AuthResult};
use crate::models::{validate_identity, Account};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One account in the legacy registry.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyEntry {
    pub external_id: i64,
    pub local_id: String,
    pub profile: serde_json::Value,
    pub credential: Option<EncryptedBlob>,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
}

/// On-disk shape of an entry. `externalId` is optional on input because
/// older snapshots only carry it as `profile.id`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    external_id: Option<i64>,
    local_id: Option<String>,
    #[serde(default)]
    profile: serde_json::Value,
    #[serde(default)]
    credential: Option<EncryptedBlob>,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    registered_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl LegacyEntry {
    /// Parse and validate one raw snapshot record.
    pub fn from_value(value: serde_json::Value) -> AuthResult<Self> {
        let wire: EntryWire = serde_json::from_value(value)
            .map_err(|e| AuthError::validation(format!("malformed legacy record: {e}")))?;

        let local_id = wire
            .local_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AuthError::validation("legacy record is missing localId"))?;

        let external_id = wire
            .external_id
            .or_else(|| profile_id(&wire.profile))
            .ok_or_else(|| {
                AuthError::validation(format!(
                    "legacy record for {local_id} has no externalId or profile.id"
                ))
            })?;

        validate_identity(&local_id, external_id)?;

        Ok(Self {
            external_id,
            local_id,
            profile: wire.profile,
            credential: wire.credential,
            is_active: wire.is_active,
            registered_at: wire.registered_at.unwrap_or_else(Utc::now),
        })
    }

    /// View this entry as a member-store account.
    pub fn to_account(&self) -> Account {
        Account {
            external_id: self.external_id,
            local_id: self.local_id.clone(),
            is_active: self.is_active,
            profile: self.profile.clone(),
            encrypted_credential: self.credential.clone(),
            registered_at: self.registered_at,
            updated_at: self.registered_at,
        }
    }

    fn to_wire(&self) -> EntryWire {
        EntryWire {
            external_id: Some(self.external_id),
            local_id: Some(self.local_id.clone()),
            profile: self.profile.clone(),
            credential: self.credential.clone(),
            is_active: self.is_active,
            registered_at: Some(self.registered_at),
        }
    }
}

/// The provider's profile carries the numeric id, sometimes as a string.
fn profile_id(profile: &serde_json::Value) -> Option<i64> {
    match profile.get("id")? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A snapshot as read from disk. Records stay raw so each one can be
/// validated (and rejected) on its own.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnapshot {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub saved_at: Option<String>,
    #[serde(default)]
    pub accounts: Vec<serde_json::Value>,
}

impl RawSnapshot {
    pub fn parse(content: &str) -> AuthResult<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// A snapshot about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacySnapshot {
    pub saved_at: DateTime<Utc>,
    pub accounts: Vec<LegacyEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotWire {
    version: u32,
    saved_at: DateTime<Utc>,
    accounts: Vec<EntryWire>,
}

impl LegacySnapshot {
    pub fn to_json(&self) -> AuthResult<String> {
        let wire = SnapshotWire {
            version: SNAPSHOT_VERSION,
            saved_at: self.saved_at,
            accounts: self.accounts.iter().map(LegacyEntry::to_wire).collect(),
        };
        Ok(serde_json::to_string_pretty(&wire)?)
    }
}

/// Durable storage for whole-collection snapshots.
#[async_trait]
pub trait SnapshotPersister: Send + Sync {
    /// Read the current snapshot, or `None` if none has been written.
    async fn load(&self) -> AuthResult<Option<RawSnapshot>>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &LegacySnapshot) -> AuthResult<()>;

    /// Human-readable location for logs.
    fn location(&self) -> String;
}

/// Snapshot stored in a single JSON file.
#[derive(Debug, Clone)]
pub struct FileSnapshotPersister {
    path: PathBuf,
}

impl FileSnapshotPersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persistence_error(&self, source: std::io::Error) -> AuthError {
        AuthError::Persistence {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotPersister for FileSnapshotPersister {
    async fn load(&self) -> AuthResult<Option<RawSnapshot>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(RawSnapshot::parse(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &LegacySnapshot) -> AuthResult<()> {
        let json = snapshot.to_json()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persistence_error(e))?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| self.persistence_error(e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.persistence_error(e))?;

        debug!(
            "Wrote legacy snapshot with {} accounts to {}",
            snapshot.accounts.len(),
            self.path.display()
        );
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
