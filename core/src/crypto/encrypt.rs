// Hybrid encryption: per-message session key + recipient-specific key wrap
//
// Body:
// 1. generate_session_key() → 32 random bytes
// 2. XChaCha20-Poly1305(session_key, random 24-byte iv, plaintext)
//
// Key wrap (one per recipient):
// 1. Generate ephemeral X25519 keypair
// 2. ECDH: ephemeral_secret × recipient_public → shared_secret
// 3. KDF: Blake3::derive_key(shared || ephemeral_pub || recipient_pub) → wrap_key
// 4. Seal: XChaCha20-Poly1305(wrap_key, random nonce, session_key, aad = ephemeral_pub)
// 5. Output: ephemeral_pub (32) || nonce (24) || sealed key (48)

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// KDF context string for deriving wrap keys from ECDH shared secrets.
/// Changing this breaks compatibility with all wrapped keys in flight.
const KDF_CONTEXT: &str = "chatrelay session key wrap 2026-10-01";

pub const SESSION_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 24;
const TAG_LEN: usize = 16;
const WRAPPED_KEY_LEN: usize = 32 + IV_LEN + SESSION_KEY_LEN + TAG_LEN;

/// Symmetric per-message key. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

pub fn generate_session_key() -> SessionKey {
    let mut bytes = [0u8; SESSION_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let key = SessionKey(bytes);
    bytes.zeroize();
    key
}

/// Encrypt a payload under a session key with a fresh random iv.
///
/// Returns `(iv, ciphertext)`; the ciphertext carries the Poly1305 tag.
pub fn encrypt_session(
    plaintext: &[u8],
    key: &SessionKey,
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((iv.to_vec(), ciphertext))
}

pub fn decrypt_session(
    iv: &[u8],
    ciphertext: &[u8],
    key: &SessionKey,
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt(XNonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn derive_wrap_key(
    shared_secret: &[u8],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    *hasher.finalize().as_bytes()
}

/// Wrap a session key so only the holder of `recipient_public`'s secret can recover it.
pub fn wrap_key(
    session_key: &SessionKey,
    recipient_public: &X25519PublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
    let shared_secret = ephemeral_secret.diffie_hellman(recipient_public);

    let mut wrap_key = derive_wrap_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_public.as_bytes(),
    );

    let mut nonce = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    wrap_key.zeroize();

    let sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: session_key.as_bytes(),
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

pub fn unwrap_key(
    wrapped: &[u8],
    recipient_secret: &StaticSecret,
) -> Result<SessionKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::UnwrapFailed);
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&wrapped[..32]);
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);
    let nonce = XNonce::from_slice(&wrapped[32..32 + IV_LEN]);
    let sealed = &wrapped[32 + IV_LEN..];

    let recipient_public = X25519PublicKey::from(recipient_secret);
    let shared_secret = recipient_secret.diffie_hellman(&ephemeral_public);
    let mut wrap_key = derive_wrap_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_public.as_bytes(),
    );

    let cipher = XChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|_| CryptoError::UnwrapFailed)?;
    wrap_key.zeroize();

    let mut plain = cipher
        .decrypt(
            nonce,
            Payload {
                msg: sealed,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::UnwrapFailed)?;

    let mut key_bytes = [0u8; SESSION_KEY_LEN];
    key_bytes.copy_from_slice(&plain);
    plain.zeroize();

    let key = SessionKey(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}
