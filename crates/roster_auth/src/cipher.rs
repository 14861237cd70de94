//! Authenticated encryption of credential payloads.
//!
//! Payloads are JSON-serialized and sealed with ChaCha20-Poly1305 under the
//! single configured 32-byte key. Every encryption draws a fresh 96-bit nonce,
//! so sealing the same credential twice never yields the same ciphertext.
//!
//! Decryption never fails loudly: a missing key, a malformed blob, or a tag
//! that does not verify all come back as `None` with a warning in the log.
//! Callers treat that as "no credential here".

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AuthError, AuthResult};

/// Nonce length in bytes.
pub const NONCE_SIZE: usize = 12;
/// Poly1305 tag length in bytes.
pub const TAG_SIZE: usize = 16;
/// Key length in bytes.
pub const KEY_SIZE: usize = 32;

/// The credential encryption key.
///
/// Zeroized on drop; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from exactly 64 hexadecimal characters.
    pub fn from_hex(hex_key: &str) -> AuthResult<Self> {
        let hex_key = hex_key.trim();
        if hex_key.len() != KEY_SIZE * 2 {
            return Err(AuthError::InvalidKey {
                reason: format!(
                    "expected {} hex characters, got {}",
                    KEY_SIZE * 2,
                    hex_key.len()
                ),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(hex_key, &mut bytes).map_err(|e| AuthError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self(bytes))
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Sealed credential as stored at rest. All fields are lowercase hex.
///
/// The ciphertext field keeps the legacy snapshot's `encrypted` name so the
/// same JSON shape is used in both the snapshot file and the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub iv: String,
    #[serde(rename = "encrypted", alias = "ciphertext")]
    pub ciphertext: String,
    pub auth_tag: String,
}

/// Seals and opens credential payloads.
///
/// Without a key every operation is a no-op returning `None`.
#[derive(Debug, Clone, Default)]
pub struct CredentialCipher {
    key: Option<EncryptionKey>,
}

impl CredentialCipher {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self { key }
    }

    /// A cipher with encryption disabled.
    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt a JSON-serializable payload.
    ///
    /// Returns `None` if no key is configured or the payload serializes to
    /// JSON `null`.
    pub fn encrypt<T: Serialize + ?Sized>(&self, plain: &T) -> Option<EncryptedBlob> {
        let key = self.key.as_ref()?;

        let value = match serde_json::to_value(plain) {
            Ok(serde_json::Value::Null) => return None,
            Ok(value) => value,
            Err(e) => {
                warn!("Credential payload could not be serialized: {}", e);
                return None;
            }
        };
        let plaintext = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Credential payload could not be serialized: {}", e);
                return None;
            }
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let sealed = match cipher.encrypt(&nonce, plaintext.as_slice()) {
            Ok(sealed) => sealed,
            Err(_) => {
                warn!("ChaCha20-Poly1305 encryption failed");
                return None;
            }
        };

        // The AEAD output is ciphertext || tag.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Some(EncryptedBlob {
            iv: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
            auth_tag: hex::encode(tag),
        })
    }

    /// Decrypt a blob back into its payload.
    ///
    /// Returns `None` on a missing key, malformed blob, failed authentication
    /// (tamper or wrong key), or a payload of the wrong shape.
    pub fn decrypt<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Option<T> {
        let Some(key) = self.key.as_ref() else {
            warn!("Cannot decrypt credential: no encryption key configured");
            return None;
        };

        let plaintext = match open(key, blob) {
            Ok(plaintext) => plaintext,
            Err(reason) => {
                warn!("Credential decryption failed: {}", reason);
                return None;
            }
        };

        match serde_json::from_slice(&plaintext) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Decrypted credential has an unexpected shape: {}", e);
                None
            }
        }
    }
}

fn open(key: &EncryptionKey, blob: &EncryptedBlob) -> Result<Vec<u8>, String> {
    let nonce = hex::decode(&blob.iv).map_err(|e| format!("bad iv: {e}"))?;
    if nonce.len() != NONCE_SIZE {
        return Err(format!("iv must be {NONCE_SIZE} bytes, got {}", nonce.len()));
    }
    let tag = hex::decode(&blob.auth_tag).map_err(|e| format!("bad auth tag: {e}"))?;
    if tag.len() != TAG_SIZE {
        return Err(format!("auth tag must be {TAG_SIZE} bytes, got {}", tag.len()));
    }
    let mut sealed = hex::decode(&blob.ciphertext).map_err(|e| format!("bad ciphertext: {e}"))?;
    sealed.extend_from_slice(&tag);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| "authentication failed".to_string())
}
