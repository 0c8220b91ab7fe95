//! # netsecfs
//!
//! A user-space encrypting filesystem. The mount point looks like a normal
//! POSIX tree; at rest, every name, key, and file content lives encrypted
//! in two SQL databases (metadata + object data).
//!
//! Multiple users share the same databases. Each user authenticates with a
//! password, owns a private tree, and can grant other users access to
//! individual subdirectories through the "shared" pseudo-directory.
//!
//! ## Key hierarchy
//!
//! ```text
//! password --Argon2id--> master_key --AEAD--> root_key, rsa_private_key
//! root_key --AEAD--> top-level directory keys
//! dir_key  --AEAD--> child names, child dir keys, file content keys
//! content_key --AEAD--> file bytes
//! ```
//!
//! Shares wrap a directory key with the grantee's RSA public key and carry
//! a signature over the plaintext name proving who granted them.
//!
//! ## Security Properties
//!
//! - No plaintext name, key, or content is ever persisted
//! - Every read traverses a key-unwrapping chain from the session root key
//! - Fresh random nonce per AEAD call; fresh content key per file write
//! - Password changes re-wrap, never regenerate, the identity keys

#![deny(unsafe_op_in_unsafe_fn)]

pub mod crypto;
pub mod error;
pub mod format;
pub mod meta;
pub mod object;
pub mod repl;
pub mod session;
pub mod vfs;

pub use error::{CryptoError, FsError};
pub use format::Format;
pub use meta::{Attr, Ino, ItemType, MetaStore, ROOT_INODE, SHARED_INODE};
pub use object::ObjectStore;
pub use session::Session;
pub use vfs::NsFs;
