//! Secret sealing for variable values.
//!
//! [`SecretCipher`] holds the data key the way a vault barrier holds its root
//! key: only in process memory, zeroized on drop, and reachable only through
//! one guard that fails with [`CipherError::KeyUnavailable`] when no key was
//! configured. Every sealed value is bound to the row path it is stored
//! under, so it opens only at that path.
//!
//! Non-secret values never pass through this module. That branch belongs to
//! the caller, so plaintext rows are never touched by cryptographic code.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto::{self, EncryptionKey};
use crate::error::CipherError;

/// HKDF context for the key that seals variable values.
const SECRETS_KEY_INFO: &[u8] = b"envstore-secrets-v1";

/// Ciphertext produced by [`SecretCipher::seal`].
///
/// The byte layout is `nonce || ciphertext || tag` and is opaque to callers.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedValue(Vec<u8>);

impl SealedValue {
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode for storage in a text record.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Decode a value previously produced by [`to_base64`](Self::to_base64).
    ///
    /// # Errors
    ///
    /// Returns the decoder error if `encoded` is not standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(encoded).map(Self)
    }
}

impl fmt::Debug for SealedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedValue")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Seals and opens secret variable values.
///
/// A cipher built with [`new`](Self::new) has no key: plain batches work,
/// while [`seal`](Self::seal) and [`open`](Self::open) return
/// [`CipherError::KeyUnavailable`].
pub struct SecretCipher {
    data_key: Option<EncryptionKey>,
}

impl SecretCipher {
    /// Create a cipher with no key material.
    #[must_use]
    pub fn new() -> Self {
        Self { data_key: None }
    }

    /// Create a cipher that seals directly with `data_key`.
    #[must_use]
    pub fn with_data_key(data_key: EncryptionKey) -> Self {
        Self {
            data_key: Some(data_key),
        }
    }

    /// Create a cipher whose data key is derived from the deployment root key.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Crypto`] if key derivation fails.
    pub fn from_root_key(root_key: &EncryptionKey) -> Result<Self, CipherError> {
        Ok(Self::with_data_key(root_key.derive(SECRETS_KEY_INFO)?))
    }

    /// Whether secrets can be sealed and opened.
    pub fn is_ready(&self) -> bool {
        self.data_key.is_some()
    }

    fn data_key(&self) -> Result<&EncryptionKey, CipherError> {
        self.data_key.as_ref().ok_or(CipherError::KeyUnavailable)
    }

    /// Seal `plaintext` for the storage row at `row`, under a fresh nonce.
    ///
    /// # Errors
    ///
    /// - [`CipherError::KeyUnavailable`] if no key is configured.
    /// - [`CipherError::Crypto`] if encryption fails.
    pub fn seal(&self, plaintext: &str, row: &str) -> Result<SealedValue, CipherError> {
        let blob = crypto::seal_row(self.data_key()?, row, plaintext.as_bytes())?;
        Ok(SealedValue(blob))
    }

    /// Open a value sealed for the storage row at `row`.
    ///
    /// # Errors
    ///
    /// - [`CipherError::KeyUnavailable`] if no key is configured.
    /// - [`CipherError::Crypto`] if authentication fails, including a value
    ///   sealed for another row.
    /// - [`CipherError::InvalidUtf8`] if the plaintext is not UTF-8.
    pub fn open(&self, sealed: &SealedValue, row: &str) -> Result<String, CipherError> {
        let plaintext = crypto::open_row(self.data_key()?, row, &sealed.0)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }
}

impl Default for SecretCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
