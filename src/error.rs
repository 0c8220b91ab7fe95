//! Unified error kinds for netsecfs.

use std::fmt;

// ---------------------------------------------------------------------------
// Crypto errors
// ---------------------------------------------------------------------------

/// Failure inside a cryptographic primitive.
///
/// Messages are uniform and never carry key or plaintext material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD open failed: tag mismatch or corrupted ciphertext.
    BadTag,
    /// Ciphertext shorter than the nonce prefix.
    Truncated,
    /// Key has the wrong length for the cipher.
    BadKey,
    /// RSA wrap/unwrap failed.
    WrapFailed,
    /// Signature did not verify.
    BadSignature,
    /// Key derivation failed.
    Kdf,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadTag => write!(f, "decryption failed"),
            Self::Truncated => write!(f, "ciphertext truncated"),
            Self::BadKey => write!(f, "invalid key length"),
            Self::WrapFailed => write!(f, "key wrap failed"),
            Self::BadSignature => write!(f, "signature verification failed"),
            Self::Kdf => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ---------------------------------------------------------------------------
// Top-level filesystem error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    NameTooLong,
    AuthFailed,
    PermissionDenied,
    /// Caller is not the original sharer of a share row.
    NotOwner,
    Crypto(CryptoError),
    /// Transaction retries exhausted.
    Busy,
    /// Lower-layer storage error.
    Storage(String),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::NameTooLong => write!(f, "name too long"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NotOwner => write!(f, "not the owner of this share"),
            Self::Crypto(e) => write!(f, "crypto: {}", e),
            Self::Busy => write!(f, "storage busy, retries exhausted"),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for FsError {}

impl From<CryptoError> for FsError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::AlreadyExists
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}

impl FsError {
    /// Whether the underlying storage error is contention that a bounded
    /// retry loop may resolve. Matches on the message classes the SQL
    /// engine reports for lock contention and connection exhaustion.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("database is locked")
                    || msg.contains("database table is locked")
                    || msg.contains("too many connections")
                    || msg.contains("too many clients")
            }
            _ => false,
        }
    }

    /// Errno for the FUSE boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EPERM,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::AuthFailed => libc::EACCES,
            Self::PermissionDenied => libc::EPERM,
            Self::NotOwner => libc::EPERM,
            Self::Crypto(_) | Self::Busy | Self::Storage(_) => libc::EIO,
        }
    }
}
