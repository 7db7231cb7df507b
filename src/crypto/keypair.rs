use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use stellar_strkey::ed25519;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::transaction::DecoratedSignature;

/// Errors raised while parsing or validating key material
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeypairError {
    /// The value is not a strkey-encoded ed25519 secret seed
    #[error("invalid secret seed: {0}")]
    InvalidSeed(String),

    /// The value is not a strkey-encoded ed25519 account id
    #[error("invalid account address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

pub type KeypairResult<T> = Result<T, KeypairError>;

/// An ed25519 keypair addressed by its strkey account id (`G...`).
///
/// The secret seed is only ever handed out wrapped in [`Zeroizing`] so that
/// decrypted channel-account keys do not outlive the signing call.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    address: String,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn random() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self::from_raw_seed(&seed)
    }

    pub fn from_raw_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let address = ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();
        Self {
            signing_key,
            address,
        }
    }

    /// Parse a strkey secret seed (`S...`).
    pub fn from_secret(secret: &str) -> KeypairResult<Self> {
        let private_key = ed25519::PrivateKey::from_string(secret.trim())
            .map_err(|e| KeypairError::InvalidSeed(format!("{:?}", e)))?;
        Ok(Self::from_raw_seed(&private_key.0))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn secret_seed(&self) -> Zeroizing<String> {
        Zeroizing::new(ed25519::PrivateKey(self.signing_key.to_bytes()).to_string())
    }

    /// Last four bytes of the public key, used to match signatures to signers.
    pub fn hint(&self) -> [u8; 4] {
        let bytes = self.signing_key.verifying_key().to_bytes();
        [bytes[28], bytes[29], bytes[30], bytes[31]]
    }

    pub fn sign(&self, payload: &[u8]) -> DecoratedSignature {
        DecoratedSignature {
            hint: self.hint(),
            signature: self.signing_key.sign(payload).to_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Keypair {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Keypair {}

/// Returns true when the value is a raw strkey secret seed rather than ciphertext.
pub fn is_secret_seed(value: &str) -> bool {
    value.starts_with('S') && ed25519::PrivateKey::from_string(value).is_ok()
}

/// Decode an account id into its raw public key bytes.
pub fn validate_address(address: &str) -> KeypairResult<[u8; 32]> {
    ed25519::PublicKey::from_string(address)
        .map(|pk| pk.0)
        .map_err(|e| KeypairError::InvalidAddress {
            address: address.to_string(),
            reason: format!("{:?}", e),
        })
}

/// Check a raw ed25519 signature over `payload` against an account id.
pub fn verify_signature(address: &str, payload: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = validate_address(address) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(payload, &signature).is_ok()
}
