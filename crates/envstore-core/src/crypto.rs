//! Key material and AEAD primitives for sealed variable values.
//!
//! Every sealed value is bound to the storage row it was written to: the
//! row path is passed to AES-256-GCM as associated data, so a ciphertext
//! copied into another project, environment or key fails authentication.
//!
//! Blob layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`, with a
//! fresh random nonce per call.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 256-bit key, zeroized on drop and redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh root key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&Aes256Gcm::generate_key(OsRng));
        Self(bytes)
    }

    /// Decode a root key as printed by `envstore keygen`.
    ///
    /// Surrounding whitespace is ignored so keys pasted from a terminal or a
    /// secrets file with a trailing newline still load.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] unless `encoded` is
    /// standard base64 of exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            CryptoError::InvalidKeyMaterial {
                reason: e.to_string(),
            }
        })?);
        <[u8; KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self)
            .map_err(|_| CryptoError::InvalidKeyMaterial {
                reason: format!("expected {KEY_LEN} bytes, got {}", decoded.len()),
            })
    }

    /// The caller must not log the result.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Derive the key for one purpose (`info`) with HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if HKDF rejects the output
    /// length, which cannot happen for 32-byte keys.
    pub fn derive(&self, info: &[u8]) -> Result<Self, CryptoError> {
        let mut derived = Self([0u8; KEY_LEN]);
        Hkdf::<Sha256>::new(None, &self.0)
            .expand(info, &mut derived.0)
            .map_err(|e| CryptoError::KeyDerivation {
                context: String::from_utf8_lossy(info).into_owned(),
                reason: e.to_string(),
            })?;
        Ok(derived)
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypt `plaintext` for the row identified by `row`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal_row(key: &EncryptionKey, row: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let payload = Payload {
        msg: plaintext,
        aad: row.as_bytes(),
    };
    let body = key
        .aead()
        .encrypt(&nonce, payload)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut blob = Vec::with_capacity(NONCE_LEN.saturating_add(body.len()));
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Decrypt a blob produced by [`seal_row`] for the same `row`.
///
/// # Errors
///
/// - [`CryptoError::CiphertextTooShort`] if `blob` cannot hold a nonce and tag.
/// - [`CryptoError::Decryption`] if the key is wrong, the blob was altered,
///   or it was sealed for a different row.
pub fn open_row(key: &EncryptionKey, row: &str, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let min_len = NONCE_LEN + TAG_LEN;
    if blob.len() < min_len {
        return Err(CryptoError::CiphertextTooShort {
            expected: min_len,
            actual: blob.len(),
        });
    }

    let (nonce, body) = blob.split_at(NONCE_LEN);
    let payload = Payload {
        msg: body,
        aad: row.as_bytes(),
    };
    key.aead()
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}
