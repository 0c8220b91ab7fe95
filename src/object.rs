//! Object store: whole-file ciphertext blobs keyed by inode.
//!
//! One row per inode holding the wrapped content key, the ciphertext, and
//! the *plaintext* length so attribute reads never need a decryption. The
//! store knows nothing about names or unwrapped keys.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::FsError;
use crate::meta::Ino;

const MAX_RETRIES: u32 = 50;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nsfs_blob (
    inode    INTEGER PRIMARY KEY,
    key      BLOB NOT NULL,
    size     INTEGER NOT NULL,
    modified INTEGER NOT NULL,
    data     BLOB NOT NULL
);
";

/// A blob row: wrapped content key + ciphertext.
#[derive(Clone, Debug)]
pub struct Blob {
    pub wrapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub size: u64,
}

pub struct ObjectStore {
    conn: Mutex<Connection>,
}

impl ObjectStore {
    pub fn open(path: &str) -> Result<Self, FsError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, FsError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn retry<T>(&self, mut f: impl FnMut(&Connection) -> Result<T, FsError>) -> Result<T, FsError> {
        let conn = self.conn.lock().expect("object connection poisoned");
        for i in 0..MAX_RETRIES {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    debug!(tried = i + 1, error = %e, "blob operation failed, restarting");
                    thread::sleep(Duration::from_millis((i * i) as u64));
                }
                Err(e) => return Err(e),
            }
        }
        Err(FsError::Busy)
    }

    /// Full blob for an inode, or `NotFound`.
    pub fn get(&self, inode: Ino) -> Result<Blob, FsError> {
        self.retry(|conn| {
            let row: Option<Blob> = conn
                .query_row(
                    "SELECT key, data, size FROM nsfs_blob WHERE inode = ?1",
                    params![inode],
                    |row| {
                        Ok(Blob {
                            wrapped_key: row.get(0)?,
                            ciphertext: row.get(1)?,
                            size: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            row.ok_or(FsError::NotFound)
        })
    }

    /// Upsert the blob for an inode. `plaintext_size` is the decrypted
    /// length, not the ciphertext length.
    pub fn put(
        &self,
        inode: Ino,
        wrapped_key: &[u8],
        ciphertext: &[u8],
        plaintext_size: u64,
    ) -> Result<(), FsError> {
        self.retry(|conn| {
            let modified = Utc::now().timestamp_micros();
            conn.execute(
                "INSERT INTO nsfs_blob (inode, key, size, modified, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (inode) DO UPDATE
                 SET key = ?2, size = ?3, modified = ?4, data = ?5",
                params![inode, wrapped_key, plaintext_size, modified, ciphertext],
            )?;
            Ok(())
        })
    }

    /// Idempotent delete.
    pub fn delete(&self, inode: Ino) -> Result<(), FsError> {
        self.retry(|conn| {
            conn.execute("DELETE FROM nsfs_blob WHERE inode = ?1", params![inode])?;
            Ok(())
        })
    }
}
