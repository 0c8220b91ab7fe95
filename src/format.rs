//! Volume format record.
//!
//! A single JSON blob stored in `nsfs_setting` under the key `"format"`.
//! Name and block size are fixed at init; the UUID is minted once and
//! preserved across re-initialization.

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Fixed filesystem block size.
pub const BLOCK_SIZE: u32 = 4096;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Storage")]
    pub storage: String,
    #[serde(rename = "BlockSize")]
    pub block_size: u32,
}

impl Format {
    pub fn new(name: &str, storage: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            storage: storage.to_string(),
            block_size: BLOCK_SIZE,
        }
    }

    /// Reconcile a fresh format against the one already on disk.
    ///
    /// Name and block size are immutable; the stored UUID wins.
    pub fn update(&mut self, old: &Format) -> Result<(), FsError> {
        if self.name != old.name {
            return Err(FsError::Storage(format!(
                "cannot rename volume {} to {}",
                old.name, self.name
            )));
        }
        if self.block_size != old.block_size {
            return Err(FsError::Storage(format!(
                "cannot change block size from {} to {}",
                old.block_size, self.block_size
            )));
        }
        self.uuid = old.uuid.clone();
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, FsError> {
        serde_json::to_string_pretty(self).map_err(|e| FsError::Storage(format!("json: {}", e)))
    }

    pub fn from_json(data: &str) -> Result<Self, FsError> {
        serde_json::from_str(data).map_err(|e| FsError::Storage(format!("json: {}", e)))
    }
}

/// Volume-name rule: lowercase alphanumerics and dashes, 3..=63 chars, no
/// leading or trailing dash.
pub fn valid_volume_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 3 || bytes.len() > 63 {
        return false;
    }
    let ok_inner = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-';
    let ok_edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    ok_edge(bytes[0])
        && ok_edge(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| ok_inner(b))
}
