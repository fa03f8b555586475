// Cryptography module: hybrid message envelope, signatures and identities

pub mod encrypt;
pub mod keys;
pub mod sign;

pub use encrypt::{
    decrypt_session, encrypt_session, generate_session_key, unwrap_key, wrap_key, SessionKey,
};
pub use keys::{
    decode_encryption_public_key, decode_signing_public_key, encode_encryption_public_key,
    encode_signing_public_key, fingerprint, generate_encryption_keypair,
    generate_signing_keypair, ClientKeys,
};
pub use sign::{sign, signing_input, verify};

use thiserror::Error;

/// Every failure here means "reject the envelope", never "tear down the connection".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Session key unwrap failed")]
    UnwrapFailed,
    #[error("Symmetric decryption failed")]
    DecryptionFailed,
    #[error("Symmetric encryption failed")]
    EncryptionFailed,
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}
