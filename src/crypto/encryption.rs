//! At-rest encryption for channel-account private keys.
//!
//! The default cipher is AES-256-GCM keyed by `SHA-256(passphrase)`. Each
//! ciphertext carries its own random 96-bit nonce as a prefix and the whole
//! blob is base64 encoded so it can live in a text column.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption passphrase cannot be empty")]
    EmptyPassphrase,

    #[error("ciphertext is not valid base64: {0}")]
    Encoding(String),

    #[error("ciphertext is too short ({0} bytes)")]
    Truncated(usize),

    /// Wrong passphrase or tampered ciphertext
    #[error("ciphertext failed authentication")]
    Authentication,

    #[error("decrypted secret is not valid utf-8")]
    InvalidPlaintext,
}

pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Symmetric primitive used by the signature service for channel-account seeds.
pub trait PrivateKeyEncrypter: Send + Sync {
    fn encrypt(&self, secret: &str, passphrase: &str) -> EncryptionResult<String>;

    fn decrypt(&self, ciphertext: &str, passphrase: &str) -> EncryptionResult<Zeroizing<String>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmEncrypter;

impl AesGcmEncrypter {
    fn cipher(passphrase: &str) -> EncryptionResult<Aes256Gcm> {
        if passphrase.is_empty() {
            return Err(EncryptionError::EmptyPassphrase);
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(passphrase.as_bytes()));
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice())))
    }
}

impl PrivateKeyEncrypter for AesGcmEncrypter {
    fn encrypt(&self, secret: &str, passphrase: &str) -> EncryptionResult<String> {
        let cipher = Self::cipher(passphrase)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce_ref: &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> =
            GenericArray::from_slice(&nonce);

        let sealed = cipher
            .encrypt(nonce_ref, secret.as_bytes())
            .map_err(|_| EncryptionError::Authentication)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(STANDARD.encode(blob))
    }

    fn decrypt(&self, ciphertext: &str, passphrase: &str) -> EncryptionResult<Zeroizing<String>> {
        let cipher = Self::cipher(passphrase)?;

        let blob = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| EncryptionError::Encoding(e.to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(EncryptionError::Truncated(blob.len()));
        }

        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| EncryptionError::Authentication)?;

        std::str::from_utf8(&plaintext)
            .map(|s| Zeroizing::new(s.to_string()))
            .map_err(|_| EncryptionError::InvalidPlaintext)
    }
}
