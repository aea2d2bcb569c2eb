//! AES-256-GCM encryption for stored secrets, with a reversible fallback.
//!
//! Each secret is encrypted separately with a unique nonce. When no usable
//! key is configured (or the cipher misbehaves) secrets are base64-encoded
//! instead, and as a last resort kept as plaintext. Every result carries an
//! explicit [`Scheme`] tag so the store never has to guess.

use crate::config::StorageConfig;
use crate::error::TokenError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Prefix of strongly encrypted values: `AESGCM:<nonce_b64>:<ciphertext_b64>`
pub const STRONG_PREFIX: &str = "AESGCM:";

/// Prefix of fallback-encoded values: `BASE64:<b64>`
pub const FALLBACK_PREFIX: &str = "BASE64:";

/// How a stored value was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// Authenticated encryption (AES-256-GCM)
    Strong,
    /// Reversible base64 encoding, not secure
    Fallback,
    /// Stored as-is
    Plaintext,
}

impl Scheme {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Scheme::Strong)
    }
}

/// An encoded secret plus the scheme that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub value: String,
    pub scheme: Scheme,
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self.scheme {
            Scheme::Strong => self.value.as_str(),
            Scheme::Fallback | Scheme::Plaintext => "<redacted>",
        };
        f.debug_struct("EncryptedBlob")
            .field("value", &value)
            .field("scheme", &self.scheme)
            .finish()
    }
}

/// Validates that the master key is exactly 32 bytes when base64 decoded.
///
/// # Arguments
/// * `key_base64` - Base64-encoded master key
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Seals plaintext with AES-256-GCM and a random nonce.
///
/// Returns `AESGCM:<nonce_b64>:<ciphertext_b64>`.
fn seal(plaintext: &str, key: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Never reuse a nonce
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(format!(
        "{}{}:{}",
        STRONG_PREFIX,
        BASE64.encode(nonce_bytes),
        BASE64.encode(ciphertext_bytes)
    ))
}

/// Opens a value produced by [`seal`].
fn open(value: &str, key: &[u8]) -> Result<String> {
    let body = value
        .strip_prefix(STRONG_PREFIX)
        .ok_or_else(|| anyhow!("Value is not AES-GCM encrypted"))?;
    let (nonce, ciphertext) = body
        .split_once(':')
        .ok_or_else(|| anyhow!("Malformed encrypted value"))?;

    let nonce_bytes = BASE64.decode(nonce).context("Failed to decode nonce")?;
    let ciphertext_bytes = BASE64
        .decode(ciphertext)
        .context("Failed to decode ciphertext")?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let plaintext_bytes = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext_bytes.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext_bytes).context("Decrypted data is not valid UTF-8")
}

fn encode_fallback(plaintext: &str) -> String {
    format!("{}{}", FALLBACK_PREFIX, BASE64.encode(plaintext.as_bytes()))
}

fn decode_fallback(value: &str) -> Result<String> {
    let body = value
        .strip_prefix(FALLBACK_PREFIX)
        .ok_or_else(|| anyhow!("Value is not base64 encoded"))?;
    let bytes = BASE64.decode(body).context("Failed to decode base64 value")?;
    String::from_utf8(bytes).context("Decoded data is not valid UTF-8")
}

/// Encrypts secrets for the credential store.
///
/// Construction never fails: a missing or invalid key downgrades the
/// encryptor to fallback encoding and is reported with `warn!`.
#[derive(Clone)]
pub struct TokenEncryptor {
    key: Option<Vec<u8>>,
    allow_fallback: bool,
}

impl TokenEncryptor {
    /// Creates an encryptor from an optional base64 key.
    pub fn new(key_base64: Option<&str>, allow_fallback: bool) -> Self {
        let key = match key_base64 {
            Some(raw) => match validate_key(raw) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "Invalid encryption key, secrets will use fallback encoding");
                    None
                }
            },
            None => {
                warn!("No encryption key configured, secrets will use fallback encoding");
                None
            }
        };

        Self {
            key,
            allow_fallback,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.encryption_key.as_deref(), config.allow_fallback_encoding)
    }

    /// Whether strong encryption is available.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypts a secret, degrading through fallback encoding to plaintext.
    ///
    /// Each step is verified by decoding the result again before it is
    /// accepted.
    pub fn encrypt(&self, secret: &str) -> EncryptedBlob {
        if let Some(key) = &self.key {
            match seal(secret, key).and_then(|value| {
                let roundtrip = open(&value, key)?;
                if roundtrip != secret {
                    return Err(anyhow!("Round-trip verification failed"));
                }
                Ok(value)
            }) {
                Ok(value) => {
                    return EncryptedBlob {
                        value,
                        scheme: Scheme::Strong,
                    }
                }
                Err(e) => warn!(error = %e, "Strong encryption failed, falling back"),
            }
        }

        if self.allow_fallback {
            let value = encode_fallback(secret);
            match decode_fallback(&value) {
                Ok(roundtrip) if roundtrip == secret => {
                    return EncryptedBlob {
                        value,
                        scheme: Scheme::Fallback,
                    }
                }
                _ => warn!("Fallback encoding failed verification, storing plaintext"),
            }
        }

        EncryptedBlob {
            value: secret.to_string(),
            scheme: Scheme::Plaintext,
        }
    }

    /// Decrypts a blob according to its tagged scheme.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> std::result::Result<String, TokenError> {
        match blob.scheme {
            Scheme::Strong => {
                let key = self.key.as_ref().ok_or_else(|| {
                    TokenError::DecryptionFailure("no encryption key configured".to_string())
                })?;
                open(&blob.value, key).map_err(|e| TokenError::DecryptionFailure(e.to_string()))
            }
            Scheme::Fallback => decode_fallback(&blob.value)
                .map_err(|e| TokenError::DecryptionFailure(e.to_string())),
            Scheme::Plaintext => Ok(blob.value.clone()),
        }
    }

    /// Detects the scheme of an untagged legacy value by its prefix.
    pub fn classify(value: &str) -> Scheme {
        if value.starts_with(STRONG_PREFIX) {
            Scheme::Strong
        } else if value.starts_with(FALLBACK_PREFIX) {
            Scheme::Fallback
        } else {
            Scheme::Plaintext
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn test_key_validation() {
        // Valid 32-byte key (base64-encoded)
        assert!(validate_key(&test_key()).is_ok());

        // Too short
        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        // Too long
        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        // Invalid base64
        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_strong_roundtrip() {
        let encryptor = TokenEncryptor::new(Some(&test_key()), true);
        let blob = encryptor.encrypt("EAAB-my-access-token-12345");

        assert_eq!(blob.scheme, Scheme::Strong);
        assert!(blob.value.starts_with(STRONG_PREFIX));
        assert!(!blob.value.contains("EAAB-my-access-token"));
        assert_eq!(encryptor.decrypt(&blob).unwrap(), "EAAB-my-access-token-12345");
    }

    #[test]
    fn test_different_nonces() {
        let encryptor = TokenEncryptor::new(Some(&test_key()), true);
        let first = encryptor.encrypt("same-plaintext");
        let second = encryptor.encrypt("same-plaintext");

        assert_ne!(first.value, second.value);
        assert_eq!(encryptor.decrypt(&first).unwrap(), "same-plaintext");
        assert_eq!(encryptor.decrypt(&second).unwrap(), "same-plaintext");
    }

    #[test]
    fn test_missing_key_falls_back() {
        let encryptor = TokenEncryptor::new(None, true);
        assert!(!encryptor.has_key());

        let blob = encryptor.encrypt("secret");
        assert_eq!(blob.scheme, Scheme::Fallback);
        assert!(blob.value.starts_with(FALLBACK_PREFIX));
        assert_eq!(encryptor.decrypt(&blob).unwrap(), "secret");
    }

    #[test]
    fn test_invalid_key_falls_back() {
        let encryptor = TokenEncryptor::new(Some("too-short"), true);
        assert!(!encryptor.has_key());
        assert_eq!(encryptor.encrypt("secret").scheme, Scheme::Fallback);
    }

    #[test]
    fn test_plaintext_when_fallback_disabled() {
        let encryptor = TokenEncryptor::new(None, false);
        let blob = encryptor.encrypt("secret");
        assert_eq!(blob.scheme, Scheme::Plaintext);
        assert_eq!(blob.value, "secret");
        assert_eq!(encryptor.decrypt(&blob).unwrap(), "secret");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = TokenEncryptor::new(Some(&test_key()), true).encrypt("secret");
        let other = TokenEncryptor::new(Some(&BASE64.encode([1u8; 32])), true);

        assert!(matches!(
            other.decrypt(&sealed),
            Err(TokenError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_strong_blob_without_key_fails() {
        let sealed = TokenEncryptor::new(Some(&test_key()), true).encrypt("secret");
        let keyless = TokenEncryptor::new(None, true);
        assert!(keyless.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let encryptor = TokenEncryptor::new(Some(&test_key()), true);
        let mut blob = encryptor.encrypt("secret");

        // Authenticated encryption detects tampering
        blob.value.push('X');
        assert!(encryptor.decrypt(&blob).is_err());
    }

    #[test]
    fn test_classify_legacy_values() {
        assert_eq!(TokenEncryptor::classify("AESGCM:abc:def"), Scheme::Strong);
        assert_eq!(TokenEncryptor::classify("BASE64:c2VjcmV0"), Scheme::Fallback);
        assert_eq!(TokenEncryptor::classify("EAABsecret"), Scheme::Plaintext);
    }
}
