//! Cryptographic primitives: AEAD, password KDF, RSA identity keys.
//!
//! Everything here is stateless and pure with respect to its inputs, and
//! nothing logs plaintext or key material.

pub mod aead;
pub mod kdf;
pub mod rsakeys;

pub use aead::{KEY_BYTES, NONCE_BYTES};
pub use kdf::{KdfParams, KDF_KEY_BYTES, SALT_BYTES};
pub use rsakeys::RSA_BITS;
