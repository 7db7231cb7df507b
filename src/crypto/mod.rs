//! Crypto Module
//!
//! Key material for distribution and channel accounts plus the symmetric
//! cipher used to keep channel-account seeds encrypted at rest.

pub mod encryption;
pub mod keypair;

pub use encryption::{AesGcmEncrypter, EncryptionError, EncryptionResult, PrivateKeyEncrypter};
pub use keypair::{is_secret_seed, validate_address, verify_signature, Keypair, KeypairError};
