//! SQLite pool behind the member store.
//!
//! Query methods live next to the data they touch (`members.rs` for accounts
//! and race entries, `migration.rs` for the ledger); this file only owns the
//! connection and the embedded schema.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::{debug, info};

use crate::cipher::CredentialCipher;
use crate::error::AuthResult;

/// Handle to the member database (`roster.db`) and the cipher its
/// credential column is sealed with.
///
/// Clones share the pool.
#[derive(Debug, Clone)]
pub struct MemberStore {
    pool: SqlitePool,
    cipher: CredentialCipher,
}

impl MemberStore {
    /// Open the member database at `path`, creating it and its directory on
    /// first use, and bring the schema up to date.
    ///
    /// Account removal cascades to race entries, so foreign keys are switched
    /// on for every connection.
    pub async fn open(path: impl AsRef<Path>, cipher: CredentialCipher) -> AuthResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists()) {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening member database at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("synchronous", "NORMAL")
            .pragma("temp_store", "MEMORY")
            .pragma("foreign_keys", "ON");

        // Writes are short and serialized by SQLite; a few readers is plenty.
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect_with(options)
            .await?;

        Self::apply_schema(&pool).await?;

        Ok(Self { pool, cipher })
    }

    /// A throwaway member database held in memory.
    pub async fn open_in_memory(cipher: CredentialCipher) -> AuthResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .pragma("foreign_keys", "ON");

        // Every connection would get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::apply_schema(&pool).await?;

        Ok(Self { pool, cipher })
    }

    async fn apply_schema(pool: &SqlitePool) -> AuthResult<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        debug!("Member schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Seals and opens the `encrypted_credential` column.
    pub fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Round-trip a trivial query to confirm the database answers.
    pub async fn health_check(&self) -> AuthResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
