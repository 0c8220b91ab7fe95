//! Metadata model: inodes, attributes, directory entries.
//!
//! Times are persisted as i64 microseconds plus an i16 nanosecond
//! remainder, and exposed as second/nanosecond pairs.

mod store;

pub use store::MetaStore;

use std::fmt;

/// Inode number.
pub type Ino = u64;

/// The filesystem root. Exists after format, never deletable.
pub const ROOT_INODE: Ino = 1;
/// The "shared" pseudo-directory. Its listing is the per-user share table.
pub const SHARED_INODE: Ino = 2;

/// Maximum name length in bytes.
pub const MAX_NAME: usize = 255;

/// Name of the well-known edge linking the root to the shared
/// pseudo-directory. Stored unencrypted by convention.
pub const SHARED_NAME: &str = "shared";

// ---------------------------------------------------------------------------
// Node types
// ---------------------------------------------------------------------------

/// On-disk node/edge type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemType {
    File,
    Directory,
}

impl ItemType {
    pub fn code(self) -> u8 {
        match self {
            ItemType::File => 1,
            ItemType::Directory => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ItemType::File),
            2 => Some(ItemType::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::File => write!(f, "regular"),
            ItemType::Directory => write!(f, "directory"),
        }
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Attributes of a node, as returned to the VFS layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr {
    pub typ: ItemType,
    pub mode: u16,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub nlink: u32,
    pub length: u64,
    pub rdev: u32,
    pub parent: Ino,
    pub owner: u32,
}

impl Attr {
    pub fn is_dir(&self) -> bool {
        self.typ == ItemType::Directory
    }
}

/// Which attribute fields a set_attr call wants to change.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttrMask {
    pub atime: Option<(i64, u32)>,
    pub mtime: Option<(i64, u32)>,
    pub atime_now: bool,
    pub mtime_now: bool,
}

impl SetAttrMask {
    pub fn is_empty(&self) -> bool {
        self.atime.is_none() && self.mtime.is_none() && !self.atime_now && !self.mtime_now
    }

    /// True when the call sets an explicit timestamp rather than "now".
    pub fn has_absolute_time(&self) -> bool {
        self.atime.is_some() || self.mtime.is_some()
    }
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// One row of a directory listing, name still encrypted.
#[derive(Clone, Debug)]
pub struct Entry {
    pub inode: Ino,
    /// Ciphertext of the child name under the directory key (plaintext for
    /// the well-known "shared" edge).
    pub name: Vec<u8>,
    /// Wrapped child key: AEAD under the directory key for tree edges,
    /// RSA-OAEP under the grantee's public key for share rows.
    pub key: Vec<u8>,
    pub attr: Attr,
}
