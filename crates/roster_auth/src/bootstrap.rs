//! Startup: open the stores, migrate, and assemble the token manager.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RosterConfig;
use crate::db::MemberStore;
use crate::error::{AuthError, AuthResult};
use crate::legacy::{FileSnapshotPersister, LegacyStore};
use crate::migration::{MigrationCoordinator, MigrationOutcome};
use crate::models::Credential;
use crate::provider::{HttpOAuthProvider, OAuthProvider, RefreshError};
use crate::tokens::{DurableSource, LegacySource, TokenManager, TokenSource};

/// Everything a running process needs.
#[derive(Debug)]
pub struct RosterContext {
    pub config: RosterConfig,
    pub members: MemberStore,
    pub legacy: Arc<LegacyStore>,
    pub tokens: TokenManager,
    /// What the startup migration did. Callers decide whether a failed
    /// migration stops the process.
    pub migration: MigrationOutcome,
}

impl RosterContext {
    pub async fn close(&self) {
        self.members.close().await;
    }
}

/// Used when no token endpoint is configured; every refresh fails transiently.
struct UnconfiguredProvider;

#[async_trait]
impl OAuthProvider for UnconfiguredProvider {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credential, RefreshError> {
        Err(RefreshError::transport("no OAuth token endpoint configured"))
    }
}

/// Initialize with the HTTP provider from `config` and the system clock.
pub async fn initialize(config: RosterConfig) -> AuthResult<RosterContext> {
    let provider: Arc<dyn OAuthProvider> = match config.oauth.client_config() {
        Some(client) => {
            let provider = HttpOAuthProvider::new(client).map_err(|e| AuthError::Config {
                path: "[oauth]".to_string(),
                reason: e.to_string(),
            })?;
            Arc::new(provider)
        }
        None => {
            warn!("OAuth token endpoint not configured; expired tokens cannot be refreshed");
            Arc::new(UnconfiguredProvider)
        }
    };
    initialize_with(config, provider, Arc::new(SystemClock)).await
}

/// Initialize with an explicit provider and clock.
///
/// Runs the legacy migration before the legacy registry is loaded, so the
/// migration sees (and backs up) the snapshot exactly as it was on disk.
pub async fn initialize_with(
    config: RosterConfig,
    provider: Arc<dyn OAuthProvider>,
    clock: Arc<dyn Clock>,
) -> AuthResult<RosterContext> {
    let cipher = config.cipher()?;
    let members = MemberStore::open(config.storage.database_path(), cipher.clone()).await?;

    let coordinator = MigrationCoordinator::new(
        members.clone(),
        config.storage.legacy_snapshot_path(),
        config.storage.backup_path(),
    );
    let migration = coordinator.run().await?;

    let persister = Arc::new(FileSnapshotPersister::new(
        config.storage.legacy_snapshot_path(),
    ));
    let legacy = Arc::new(LegacyStore::load(persister, cipher).await?);

    let sources: Vec<Arc<dyn TokenSource>> = vec![
        Arc::new(DurableSource::new(members.clone())),
        Arc::new(LegacySource::new(legacy.clone())),
    ];
    let tokens = TokenManager::new(sources, provider, clock, config.tokens.settings());

    info!(
        "Roster initialized: {} accounts, {} legacy entries",
        members.count_accounts().await?,
        legacy.len()
    );

    Ok(RosterContext {
        config,
        members,
        legacy,
        tokens,
        migration,
    })
}
