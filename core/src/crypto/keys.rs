// Client key material
//
// Every client carries two independent key pairs:
// - Ed25519 signing pair: signs envelopes, its public half is the durable identity
// - X25519 encryption pair: receives wrapped session keys
//
// The client id is SHA-256 over the raw signing public key, base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use super::CryptoError;

/// Generate a fresh Ed25519 signing pair.
pub fn generate_signing_keypair() -> (VerifyingKey, SigningKey) {
    let mut secret_key_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
    let signing_key = SigningKey::from_bytes(&secret_key_bytes);
    secret_key_bytes.zeroize();
    (signing_key.verifying_key(), signing_key)
}

/// Generate a fresh X25519 encryption pair.
pub fn generate_encryption_keypair() -> (X25519PublicKey, StaticSecret) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    (X25519PublicKey::from(&secret), secret)
}

/// Derive the stable client id from raw public key bytes.
pub fn fingerprint(public_key: &[u8]) -> String {
    BASE64.encode(Sha256::digest(public_key))
}

pub fn encode_signing_public_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

pub fn encode_encryption_public_key(key: &X25519PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Decode a base64 Ed25519 public key, rejecting anything that is not a valid point.
pub fn decode_signing_public_key(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = decode_key_bytes(encoded)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| CryptoError::InvalidKey("not an Ed25519 public key".to_string()))
}

pub fn decode_encryption_public_key(encoded: &str) -> Result<X25519PublicKey, CryptoError> {
    Ok(X25519PublicKey::from(decode_key_bytes(encoded)?))
}

fn decode_key_bytes(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32 key bytes".to_string()))
}

/// Both key pairs of one client.
#[derive(Clone)]
pub struct ClientKeys {
    signing_key: SigningKey,
    encryption_secret: StaticSecret,
}

impl ClientKeys {
    /// Generate new signing and encryption pairs
    pub fn generate() -> Self {
        let (_, signing_key) = generate_signing_keypair();
        let (_, encryption_secret) = generate_encryption_keypair();
        Self {
            signing_key,
            encryption_secret,
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    pub fn encryption_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.encryption_secret)
    }

    /// Signing public key as sent on the wire
    pub fn public_key_b64(&self) -> String {
        encode_signing_public_key(&self.verifying_key())
    }

    /// Encryption public key as sent on the wire
    pub fn encryption_key_b64(&self) -> String {
        encode_encryption_public_key(&self.encryption_public())
    }

    pub fn client_id(&self) -> String {
        fingerprint(self.verifying_key().as_bytes())
    }

    /// Serialize both secrets (signing || encryption).
    /// The buffer wipes itself on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(64));
        bytes.extend_from_slice(&self.signing_key.to_bytes());
        bytes.extend_from_slice(&self.encryption_secret.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidKey("expected 64 secret bytes".to_string()));
        }
        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);

        let keys = Self {
            signing_key: SigningKey::from_bytes(&signing),
            encryption_secret: StaticSecret::from(encryption),
        };

        signing.zeroize();
        encryption.zeroize();
        Ok(keys)
    }
}

impl std::fmt::Debug for ClientKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKeys")
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}
