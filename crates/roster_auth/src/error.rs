//! Error types for roster_auth.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Which identity invariant a write would have violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another active account already holds this local (chat-platform) id.
    DuplicateLocalId,
    /// An active account already exists for this external (provider) id.
    DuplicateActiveExternalId,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateLocalId => f.write_str("DuplicateLocalId"),
            Self::DuplicateActiveExternalId => f.write_str("DuplicateActiveExternalId"),
        }
    }
}

/// Errors that can occur in auth operations.
#[derive(Debug, Error, Diagnostic)]
pub enum AuthError {
    /// Database error from sqlx.
    #[error("Database error: {0}")]
    #[diagnostic(code(roster_auth::database))]
    Database(#[from] sqlx::Error),

    /// Schema migration error.
    #[error("Migration error: {0}")]
    #[diagnostic(code(roster_auth::migration))]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// IO error.
    #[error("IO error: {0}")]
    #[diagnostic(code(roster_auth::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(roster_auth::serde))]
    Serde(#[from] serde_json::Error),

    /// A credential write was attempted without a configured encryption key.
    #[error("NoEncryptionKey: credential encryption is not configured")]
    #[diagnostic(
        code(roster_auth::no_encryption_key),
        help("Set ENCRYPTION_KEY (64 hex characters) or [crypto].encryption_key")
    )]
    NoEncryptionKey,

    /// Writing the legacy snapshot failed; the in-memory state was left untouched.
    #[error("Failed to persist legacy snapshot {path}: {source}")]
    #[diagnostic(code(roster_auth::persistence))]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Identity invariant violation.
    #[error("Conflict: {kind} ({id})")]
    #[diagnostic(code(roster_auth::conflict))]
    Conflict { kind: ConflictKind, id: String },

    /// Malformed input.
    #[error("Validation failed: {message}")]
    #[diagnostic(code(roster_auth::validation))]
    Validation { message: String },

    /// The configured key is not 64 hex characters.
    #[error("Invalid encryption key: {reason}")]
    #[diagnostic(
        code(roster_auth::invalid_key),
        help("The key must be exactly 64 hexadecimal characters (32 bytes)")
    )]
    InvalidKey { reason: String },

    /// Configuration could not be loaded.
    #[error("Configuration error in {path}: {reason}")]
    #[diagnostic(code(roster_auth::config))]
    Config { path: String, reason: String },

    /// The migration ledger could not be written; startup must not continue.
    #[error("Failed to record migration {name} in ledger: {source}")]
    #[diagnostic(
        code(roster_auth::ledger),
        help("The store may be half-migrated; fix the database and restart")
    )]
    Ledger {
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

impl AuthError {
    /// Create a conflict error.
    pub fn conflict(kind: ConflictKind, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// The conflict kind, if this is an identity conflict.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            Self::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this is an I/O failure on either store.
    ///
    /// Mutating calls propagate these so the caller knows the operation did
    /// not happen.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Migration(_)
                | Self::Io(_)
                | Self::Serde(_)
                | Self::NoEncryptionKey
                | Self::Persistence { .. }
                | Self::Ledger { .. }
        )
    }
}
