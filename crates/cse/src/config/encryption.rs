//! Encryption at rest of config files.
//!
//! Files are Fernet tokens. The key is derived from the password with
//! PBKDF2-HMAC-SHA256; files written by older releases used the plain
//! SHA-256 digest of the password as key and are still accepted.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use fernet::Fernet;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

const KDF_SALT: &[u8] = b"cse-config-encryption-salt";
const KDF_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("invalid encryption key")]
    InvalidKey,
    #[error("wrong password or the content is not an encrypted CSE config")]
    InvalidToken,
    #[error("decrypted content is not valid UTF-8")]
    NotUtf8,
}

/// Decrypted content and which key opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub content: String,
    pub used_legacy_key: bool,
}

fn derived_key(password: &str) -> String {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
    URL_SAFE.encode(key)
}

fn legacy_key(password: &str) -> String {
    URL_SAFE.encode(Sha256::digest(password.as_bytes()))
}

fn cipher(key: &str) -> Result<Fernet, EncryptionError> {
    Fernet::new(key).ok_or(EncryptionError::InvalidKey)
}

pub fn encrypt(content: &str, password: &str) -> Result<String, EncryptionError> {
    Ok(cipher(&derived_key(password))?.encrypt(content.as_bytes()))
}

pub fn decrypt(token: &str, password: &str) -> Result<Decrypted, EncryptionError> {
    let token = token.trim();
    let (bytes, used_legacy_key) = match cipher(&derived_key(password))?.decrypt(token) {
        Ok(bytes) => (bytes, false),
        Err(_) => {
            let bytes = cipher(&legacy_key(password))?
                .decrypt(token)
                .map_err(|_| EncryptionError::InvalidToken)?;
            warn!(
                "Config was encrypted with a deprecated key derivation; \
                 re-encrypt it with `cse encrypt`"
            );
            (bytes, true)
        }
    };
    let content = String::from_utf8(bytes).map_err(|_| EncryptionError::NotUtf8)?;
    Ok(Decrypted {
        content,
        used_legacy_key,
    })
}
