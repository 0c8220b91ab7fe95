//! RSA identity keys: OAEP(SHA-512) key wrap + PKCS#1 v1.5 signatures.
//!
//! Every user owns a 2048-bit RSA keypair generated at signup and kept for
//! the lifetime of the account. The private key travels only as
//! PKCS#1 DER wrapped under the user's master key; the public key is
//! stored in the clear so other users can address shares to it.
//!
//! Serialization:
//!   private key = PKCS#1 DER (wrapped by AEAD before persistence)
//!   public key  = PKCS#1 DER (stored as-is)

use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// RSA modulus size for identity keypairs.
pub const RSA_BITS: usize = 2048;

/// Generate a fresh identity keypair.
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let mut rng = OsRng;
    let private = RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(|_| CryptoError::WrapFailed)?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// PKCS#1 DER encoding of the private key. Callers wrap the result with
/// AEAD before it goes anywhere near a database.
pub fn private_key_der(key: &RsaPrivateKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let der = key.to_pkcs1_der().map_err(|_| CryptoError::WrapFailed)?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

pub fn private_key_from_der(der: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs1_der(der).map_err(|_| CryptoError::WrapFailed)
}

/// PKCS#1 DER encoding of the public key; stored in the clear.
pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    let der = key.to_pkcs1_der().map_err(|_| CryptoError::WrapFailed)?;
    Ok(der.as_bytes().to_vec())
}

pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|_| CryptoError::WrapFailed)
}

// ---------------------------------------------------------------------------
// Key wrap (share protocol)
// ---------------------------------------------------------------------------

/// Wrap key material for a recipient: RSA-OAEP with SHA-512 MGF.
///
/// Empty input yields empty output.
pub fn wrap(public: &RsaPublicKey, key_material: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key_material.is_empty() {
        return Ok(Vec::new());
    }
    let mut rng = OsRng;
    public
        .encrypt(&mut rng, Oaep::new::<Sha512>(), key_material)
        .map_err(|_| CryptoError::WrapFailed)
}

pub fn unwrap(private: &RsaPrivateKey, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if wrapped.is_empty() {
        return Ok(Zeroizing::new(Vec::new()));
    }
    private
        .decrypt(Oaep::new::<Sha512>(), wrapped)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::WrapFailed)
}

// ---------------------------------------------------------------------------
// Signatures (share ownership)
// ---------------------------------------------------------------------------

/// PKCS#1 v1.5 signature over the SHA-512 digest of `message`.
pub fn sign(private: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha512::digest(message);
    private
        .sign(Pkcs1v15Sign::new::<Sha512>(), &digest)
        .map_err(|_| CryptoError::WrapFailed)
}

pub fn verify(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let digest = Sha512::digest(message);
    public
        .verify(Pkcs1v15Sign::new::<Sha512>(), &digest, signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        generate_keypair().unwrap()
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (sk, pk) = keypair();
        let material = [0x42u8; 32];
        let wrapped = wrap(&pk, &material).unwrap();
        assert_ne!(wrapped, material);
        let out = unwrap(&sk, &wrapped).unwrap();
        assert_eq!(out.as_slice(), &material);
    }

    #[test]
    fn wrap_empty_is_noop() {
        let (sk, pk) = keypair();
        assert!(wrap(&pk, b"").unwrap().is_empty());
        assert!(unwrap(&sk, b"").unwrap().is_empty());
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let (_, pk) = keypair();
        let (other_sk, _) = keypair();
        let wrapped = wrap(&pk, &[7u8; 32]).unwrap();
        assert!(unwrap(&other_sk, &wrapped).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, pk) = keypair();
        let sig = sign(&sk, b"proj").unwrap();
        assert!(verify(&pk, b"proj", &sig).is_ok());
        assert_eq!(verify(&pk, b"other", &sig), Err(CryptoError::BadSignature));
    }

    #[test]
    fn verify_rejects_foreign_signature() {
        let (sk, _) = keypair();
        let (_, other_pk) = keypair();
        let sig = sign(&sk, b"proj").unwrap();
        assert_eq!(
            verify(&other_pk, b"proj", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn private_key_der_roundtrip() {
        let (sk, _) = keypair();
        let der = private_key_der(&sk).unwrap();
        let back = private_key_from_der(&der).unwrap();
        assert_eq!(back, sk);
    }
}
