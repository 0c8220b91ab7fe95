//! Password KDF: Argon2id master-key derivation + SHA-512 digest.
//!
//! master_key = Argon2id(password, salt, m=512 MiB, t=5, p=2, len=32)
//! pwd_hash   = SHA-512(master_key)
//!
//! The Argon2id parameters are part of the on-disk format: every stored
//! `pwd_hash` and wrapped key was produced under them, so changing them is
//! a breaking migration for existing users.

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Argon2id memory cost in KiB (512 MiB).
pub const KDF_MEMORY_KIB: u32 = 512 * 1024;
/// Argon2id iteration count.
pub const KDF_ITERATIONS: u32 = 5;
/// Argon2id lane count.
pub const KDF_PARALLELISM: u32 = 2;
/// Derived key length.
pub const KDF_KEY_BYTES: usize = 32;
/// Salt length generated at signup and password change.
pub const SALT_BYTES: usize = 16;

/// Argon2id cost parameters.
///
/// `Default` is the production profile above. Anything else exists for
/// test fixtures only; keys wrapped under one profile cannot be recovered
/// under another.
#[derive(Clone, Copy, Debug)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_KIB,
            iterations: KDF_ITERATIONS,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Cheap profile for test fixtures.
    pub fn insecure_test() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Derive the 32-byte master key from a password and salt.
///
/// The master key is never persisted; it only wraps the user's root key
/// and private key, and its SHA-512 digest is what the user row stores.
pub fn derive_master_key(
    params: &KdfParams,
    password: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<[u8; KDF_KEY_BYTES]>, CryptoError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KDF_KEY_BYTES),
    )
    .map_err(|_| CryptoError::Kdf)?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; KDF_KEY_BYTES]);
    argon
        .hash_password_into(password, salt, &mut *out)
        .map_err(|_| CryptoError::Kdf)?;
    Ok(out)
}

/// SHA-512 digest of the master key, stored as the password verifier.
pub fn password_digest(master_key: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(master_key));
    out
}

/// Fresh random salt.
pub fn generate_salt() -> Result<[u8; SALT_BYTES], CryptoError> {
    let mut salt = [0u8; SALT_BYTES];
    getrandom::getrandom(&mut salt).map_err(|_| CryptoError::Kdf)?;
    Ok(salt)
}
