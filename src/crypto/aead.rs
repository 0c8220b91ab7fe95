//! AEAD: AES-256-GCM with a prepended random nonce.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;

use crate::error::CryptoError;

/// AES-256 key length.
pub const KEY_BYTES: usize = 32;
/// GCM nonce length; prepended to every ciphertext.
pub const NONCE_BYTES: usize = 12;

/// Generate a random 12-byte nonce. Used during encryption only.
///
/// Never use more than ~2^32 random nonces with a given key because of
/// the risk of a repeat; callers treat that as a soft per-key budget.
fn nonce() -> Result<[u8; NONCE_BYTES], CryptoError> {
    let mut n = [0u8; NONCE_BYTES];
    getrandom(&mut n).map_err(|_| CryptoError::BadKey)?;
    Ok(n)
}

/// Encrypt `plaintext` under `key`, returning `nonce || ciphertext || tag`.
///
/// An empty key is a pass-through: the plaintext is returned unchanged.
/// That convention exists solely for the well-known "shared" edge written
/// at format time; callers never pass an empty key for user data.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.is_empty() {
        return Ok(plaintext.to_vec());
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKey)?;
    let n = nonce()?;
    let ct = cipher
        .encrypt(Nonce::from_slice(&n), plaintext)
        .map_err(|_| CryptoError::BadTag)?;
    let mut out = Vec::with_capacity(NONCE_BYTES + ct.len());
    out.extend_from_slice(&n);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `nonce || ciphertext || tag` under `key`.
///
/// Truncated input and tag mismatch are distinct error kinds; neither is
/// ever retried, and the ciphertext is never returned on failure.
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.is_empty() {
        return Ok(ciphertext.to_vec());
    }
    if ciphertext.len() < NONCE_BYTES {
        return Err(CryptoError::Truncated);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKey)?;
    let (n, ct) = ciphertext.split_at(NONCE_BYTES);
    cipher
        .decrypt(Nonce::from_slice(n), ct)
        .map_err(|_| CryptoError::BadTag)
}

/// Fresh 32-byte key from the system CSPRNG.
pub fn generate_key() -> Result<[u8; KEY_BYTES], CryptoError> {
    let mut k = [0u8; KEY_BYTES];
    getrandom(&mut k).map_err(|_| CryptoError::BadKey)?;
    Ok(k)
}
