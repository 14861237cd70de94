//! Configuration loading.
//!
//! Settings come from a TOML file and are then overridden from the
//! environment. Relative paths in the file are resolved against the file's
//! directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cipher::{CredentialCipher, EncryptionKey};
use crate::error::{AuthError, AuthResult};
use crate::provider::OAuthClientConfig;
use crate::tokens::{RevocationPolicy, TokenSettings, DEFAULT_SAFETY_MARGIN_SECS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub oauth: OAuthConfig,
    pub tokens: TokensConfig,
}

/// Where data lives on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Member database file. Defaults to `<data_dir>/roster.db`.
    pub database: Option<PathBuf>,
    /// Legacy snapshot file. Defaults to `<data_dir>/users.json`.
    pub legacy_snapshot: Option<PathBuf>,
    /// Migration backups. Defaults to `<data_dir>/backups`.
    pub backup_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("roster"),
            database: None,
            legacy_snapshot: None,
            backup_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("roster.db"))
    }

    pub fn legacy_snapshot_path(&self) -> PathBuf {
        self.legacy_snapshot
            .clone()
            .unwrap_or_else(|| self.data_dir.join("users.json"))
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    fn resolve_relative(&mut self, base_dir: &Path) {
        self.data_dir = resolve_path(base_dir, &self.data_dir);
        for path in [
            &mut self.database,
            &mut self.legacy_snapshot,
            &mut self.backup_dir,
        ]
        .into_iter()
        .flatten()
        {
            *path = resolve_path(base_dir, path);
        }
    }
}

/// Credential encryption settings.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// 64 hex characters. Without it credentials are not stored.
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Provider token endpoint settings.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl OAuthConfig {
    /// Client settings, if both the token URL and client id are set.
    pub fn client_config(&self) -> Option<OAuthClientConfig> {
        Some(OAuthClientConfig {
            token_url: self.token_url.clone()?,
            client_id: self.client_id.clone()?,
            client_secret: self.client_secret.clone(),
        })
    }
}

/// Token lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    pub safety_margin_secs: i64,
    pub revocation_policy: RevocationPolicy,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            revocation_policy: RevocationPolicy::default(),
        }
    }
}

impl TokensConfig {
    pub fn settings(&self) -> TokenSettings {
        TokenSettings {
            safety_margin_secs: self.safety_margin_secs,
            revocation_policy: self.revocation_policy,
        }
    }
}

impl RosterConfig {
    /// Load configuration from a TOML file.
    pub async fn load(path: &Path) -> AuthResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AuthError::Config {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut config: RosterConfig = toml::from_str(&content).map_err(|e| AuthError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let base_dir = path.parent().unwrap_or(Path::new("."));
        config.storage.resolve_relative(base_dir);

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the first standard location that exists, else defaults.
    pub async fn load_from_standard_locations() -> AuthResult<Self> {
        for path in config_paths() {
            if path.exists() {
                return Self::load(&path).await;
            }
        }
        debug!("No configuration file found; using defaults");
        Ok(Self::default())
    }

    /// Override settings from process environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    /// Override settings from `lookup`, which maps variable names to values.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut Option<String>, name: &str| {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                *target = Some(value.trim().to_string());
            }
        };
        set(&mut self.crypto.encryption_key, "ENCRYPTION_KEY");
        set(&mut self.oauth.token_url, "OAUTH_TOKEN_URL");
        set(&mut self.oauth.client_id, "OAUTH_CLIENT_ID");
        set(&mut self.oauth.client_secret, "OAUTH_CLIENT_SECRET");
    }

    /// Build the credential cipher.
    ///
    /// A missing key disables encryption; a malformed one is an error.
    pub fn cipher(&self) -> AuthResult<CredentialCipher> {
        match self.crypto.encryption_key.as_deref() {
            Some(hex_key) => Ok(CredentialCipher::new(Some(EncryptionKey::from_hex(
                hex_key,
            )?))),
            None => {
                warn!("No encryption key configured; credentials will not be stored");
                Ok(CredentialCipher::disabled())
            }
        }
    }
}

/// Standard configuration file locations, in lookup order.
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("roster.toml")];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("roster").join("config.toml"));
    }
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".roster").join("config.toml"));
    }
    paths
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
