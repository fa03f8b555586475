// Salted Ed25519 envelope signatures
//
// Ed25519 alone is deterministic, so every signature is prefixed with 32 fresh
// random bytes that are signed together with the canonical envelope bytes:
//
//   signature = salt || Ed25519(salt || canonical({"counter": n, "data": payload}))
//
// Signing the same (payload, counter) twice yields different signature bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde_json::Value;

use super::CryptoError;

pub const SALT_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = SALT_LEN + 64;

/// Canonical bytes covered by an envelope signature.
///
/// Compact JSON of `{"counter": counter, "data": payload}`; object keys come out
/// in serde_json's map order on both ends because both sides serialize the same
/// `Value` tree.
pub fn signing_input(payload: &Value, counter: u64) -> Result<Vec<u8>, CryptoError> {
    let mut envelope = serde_json::Map::new();
    envelope.insert("counter".to_string(), Value::from(counter));
    envelope.insert("data".to_string(), payload.clone());
    serde_json::to_vec(&Value::Object(envelope))
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

pub fn sign(
    payload: &Value,
    counter: u64,
    signing_key: &SigningKey,
) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut message = salt.to_vec();
    message.extend_from_slice(&signing_input(payload, counter)?);

    let signature = signing_key.sign(&message);

    let mut out = Vec::with_capacity(SIGNATURE_LEN);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&signature.to_bytes());
    Ok(out)
}

pub fn verify(
    payload: &Value,
    counter: u64,
    signature: &[u8],
    public_key: &VerifyingKey,
) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::VerificationFailed);
    }
    let (salt, sig_bytes) = signature.split_at(SALT_LEN);
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| CryptoError::VerificationFailed)?;

    let mut message = salt.to_vec();
    message.extend_from_slice(&signing_input(payload, counter)?);

    public_key
        .verify_strict(&message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| CryptoError::VerificationFailed)
}
