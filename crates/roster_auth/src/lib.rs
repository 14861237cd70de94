//! Roster Auth - credential storage and token lifecycle for Roster.
//!
//! This crate holds every account a chat user has linked to the resource
//! provider, together with the OAuth credential for it:
//! - Credentials are sealed with ChaCha20-Poly1305 before they touch disk
//! - The member database (SQLite) is the durable registry
//! - The legacy registry (one JSON snapshot file) stays readable while
//!   deployments migrate off it
//! - The token manager hands out valid access tokens, refreshing them
//!   through the provider when they are about to expire
//!
//! # Architecture
//!
//! [`bootstrap::initialize`] opens the member database, backfills it once
//! from the legacy snapshot, loads the legacy registry, and wires both into a
//! [`TokenManager`] as ordered tiers (durable first, legacy as fallback).

pub mod bootstrap;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod legacy;
mod members;
pub mod migration;
pub mod models;
pub mod provider;
pub mod tokens;

pub use bootstrap::{initialize, initialize_with, RosterContext};
pub use cipher::{CredentialCipher, EncryptedBlob, EncryptionKey};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RosterConfig;
pub use db::MemberStore;
pub use error::{AuthError, AuthResult, ConflictKind};
pub use legacy::{
    ConsistencyViolation, FileSnapshotPersister, LegacyEntry, LegacyStore, SnapshotPersister,
};
pub use migration::{
    MigrationCoordinator, MigrationOutcome, MigrationReport, MigrationState,
    LEGACY_MIGRATION_NAME,
};
pub use models::{Account, Credential, MigrationLedgerEntry, RaceEntry};
pub use provider::{HttpOAuthProvider, OAuthClientConfig, OAuthProvider, RefreshError};
pub use tokens::{
    AccessStatus, DurableSource, ForcedRefresh, LegacySource, RevocationPolicy, TokenManager,
    TokenSettings, TokenSource,
};
