//! SQL-backed metadata store.
//!
//! One `rusqlite::Connection` guarded by a mutex. Every mutating operation
//! runs inside `txn`: up to 50 attempts with quadratic backoff, retrying
//! only on lock contention, then `Busy`. Read-only operations share the
//! retry policy without an explicit transaction.
//!
//! The store persists ciphertext names and wrapped keys only; it never
//! sees a plaintext name, an unwrapped key, or file content.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::FsError;
use crate::format::Format;
use crate::meta::{
    Attr, Entry, Ino, ItemType, SetAttrMask, ROOT_INODE, SHARED_INODE, SHARED_NAME,
};

const MAX_TXN_RETRIES: u32 = 50;

/// Parent mtime updates on file creation are skipped when the previous
/// update is closer than this (microseconds).
const SKIP_DIR_MTIME_MICROS: i64 = 100_000;

/// Wrapped-key chain walks refuse to go deeper than this.
const MAX_DEPTH: usize = 256;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nsfs_setting (
    name  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS nsfs_node (
    inode     INTEGER PRIMARY KEY,
    type      INTEGER NOT NULL,
    mode      INTEGER NOT NULL,
    atime     INTEGER NOT NULL,
    mtime     INTEGER NOT NULL,
    ctime     INTEGER NOT NULL,
    atimensec INTEGER NOT NULL DEFAULT 0,
    mtimensec INTEGER NOT NULL DEFAULT 0,
    ctimensec INTEGER NOT NULL DEFAULT 0,
    nlink     INTEGER NOT NULL,
    length    INTEGER NOT NULL,
    rdev      INTEGER NOT NULL DEFAULT 0,
    parent    INTEGER NOT NULL,
    owner     INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS nsfs_edge (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    parent INTEGER NOT NULL,
    name   BLOB NOT NULL,
    inode  INTEGER NOT NULL,
    type   INTEGER NOT NULL,
    key    BLOB NOT NULL,
    UNIQUE (parent, name)
);
CREATE INDEX IF NOT EXISTS idx_nsfs_edge_inode ON nsfs_edge (inode);
CREATE TABLE IF NOT EXISTS nsfs_user (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password BLOB NOT NULL,
    salt     BLOB NOT NULL,
    root_key BLOB NOT NULL,
    pr_key   BLOB NOT NULL,
    pub_key  BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS nsfs_shared (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    inode INTEGER NOT NULL,
    name  BLOB NOT NULL,
    user  INTEGER NOT NULL,
    key   BLOB NOT NULL,
    sign  BLOB NOT NULL,
    UNIQUE (user, inode)
);
";

const NODE_COLS: &str =
    "type, mode, atime, mtime, ctime, atimensec, mtimensec, ctimensec, nlink, length, rdev, parent, owner";

pub struct MetaStore {
    conn: Mutex<Connection>,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Now as (microseconds, nanosecond remainder).
fn now_micros() -> (i64, i64) {
    let now = Utc::now();
    (
        now.timestamp_micros(),
        (now.timestamp_subsec_nanos() % 1000) as i64,
    )
}

fn parse_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attr> {
    let typ: u8 = row.get(0)?;
    let atime: i64 = row.get(2)?;
    let mtime: i64 = row.get(3)?;
    let ctime: i64 = row.get(4)?;
    let atimensec: i64 = row.get(5)?;
    let mtimensec: i64 = row.get(6)?;
    let ctimensec: i64 = row.get(7)?;
    Ok(Attr {
        typ: ItemType::from_code(typ).unwrap_or(ItemType::File),
        mode: row.get(1)?,
        atime: atime.div_euclid(1_000_000),
        mtime: mtime.div_euclid(1_000_000),
        ctime: ctime.div_euclid(1_000_000),
        atimensec: (atime.rem_euclid(1_000_000) * 1000 + atimensec) as u32,
        mtimensec: (mtime.rem_euclid(1_000_000) * 1000 + mtimensec) as u32,
        ctimensec: (ctime.rem_euclid(1_000_000) * 1000 + ctimensec) as u32,
        nlink: row.get(8)?,
        length: row.get(9)?,
        rdev: row.get(10)?,
        parent: row.get(11)?,
        owner: row.get(12)?,
    })
}

fn get_node(tx: &Connection, inode: Ino) -> Result<Attr, FsError> {
    let attr = tx
        .query_row(
            &format!("SELECT {} FROM nsfs_node WHERE inode = ?1", NODE_COLS),
            params![inode],
            parse_node_row,
        )
        .optional()?;
    attr.ok_or(FsError::NotFound)
}

/// Allocate the next inode from the counter row, bumping it in place.
fn alloc_inode(tx: &Transaction<'_>) -> Result<Ino, FsError> {
    let next: Option<String> = tx
        .query_row(
            "SELECT value FROM nsfs_setting WHERE name = 'next_inode'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let next: Ino = match next {
        Some(v) => v
            .parse()
            .map_err(|_| FsError::Storage("corrupt next_inode counter".into()))?,
        None => return Err(FsError::Storage("volume is not formatted".into())),
    };
    tx.execute(
        "UPDATE nsfs_setting SET value = ?1 WHERE name = 'next_inode'",
        params![(next + 1).to_string()],
    )?;
    Ok(next)
}

fn backoff(attempt: u32) {
    thread::sleep(Duration::from_millis((attempt * attempt) as u64));
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl MetaStore {
    pub fn open(path: &str) -> Result<Self, FsError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, FsError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Mutating transaction with bounded retry on contention.
    fn txn<T>(&self, mut f: impl FnMut(&Transaction<'_>) -> Result<T, FsError>) -> Result<T, FsError> {
        let mut conn = self.conn.lock().expect("meta connection poisoned");
        let mut last = FsError::Busy;
        for i in 0..MAX_TXN_RETRIES {
            let tx = match conn.transaction() {
                Ok(tx) => tx,
                Err(e) => {
                    let e = FsError::from(e);
                    if e.is_retryable() {
                        last = e;
                        backoff(i);
                        continue;
                    }
                    return Err(e);
                }
            };
            let result = f(&tx);
            match result {
                Ok(v) => match tx.commit() {
                    Ok(()) => {
                        if i > 1 {
                            warn!(tries = i + 1, "transaction succeeded after retries");
                        }
                        return Ok(v);
                    }
                    Err(e) => {
                        let e = FsError::from(e);
                        if e.is_retryable() {
                            debug!(tried = i + 1, error = %e, "commit failed, restarting");
                            last = e;
                            backoff(i);
                            continue;
                        }
                        return Err(e);
                    }
                },
                Err(e) if e.is_retryable() => {
                    debug!(tried = i + 1, error = %e, "transaction failed, restarting");
                    last = e;
                    backoff(i);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(tries = MAX_TXN_RETRIES, error = %last, "giving up on transaction");
        Err(FsError::Busy)
    }

    /// Read-only operation with the same retry policy.
    fn ro_txn<T>(&self, mut f: impl FnMut(&Connection) -> Result<T, FsError>) -> Result<T, FsError> {
        let conn = self.conn.lock().expect("meta connection poisoned");
        let mut last = FsError::Busy;
        for i in 0..MAX_TXN_RETRIES {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    debug!(tried = i + 1, error = %e, "read failed, restarting");
                    last = e;
                    backoff(i);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(tries = MAX_TXN_RETRIES, error = %last, "giving up on read");
        Err(FsError::Busy)
    }

    // -----------------------------------------------------------------------
    // Format / init
    // -----------------------------------------------------------------------

    /// One-time volume format. Creates the schema, reconciles the format
    /// record (UUID is preserved across re-runs; name and block size must
    /// match), and seeds the root and "shared" nodes on first run.
    pub fn init(&self, format: &mut Format) -> Result<(), FsError> {
        {
            let conn = self.conn.lock().expect("meta connection poisoned");
            conn.execute_batch(SCHEMA)?;
        }

        let existing: Option<String> = self.ro_txn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM nsfs_setting WHERE name = 'format'",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        if let Some(raw) = existing.as_deref() {
            let old = Format::from_json(raw)?;
            format.update(&old)?;
        }

        let data = format.to_json()?;
        let fresh = existing.is_none();
        let (now, nowns) = now_micros();

        self.txn(move |tx| {
            if fresh {
                tx.execute(
                    "INSERT INTO nsfs_setting (name, value) VALUES ('format', ?1)",
                    params![data],
                )?;
                tx.execute(
                    "INSERT INTO nsfs_setting (name, value) VALUES ('next_inode', '3')",
                    [],
                )?;
                // Root: mode 0755, nlink 3 (".", ".." and the shared child).
                tx.execute(
                    "INSERT INTO nsfs_node (inode, type, mode, atime, mtime, ctime,
                                            atimensec, mtimensec, ctimensec,
                                            nlink, length, rdev, parent, owner)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?5, ?5, ?5, 3, 4096, 0, ?1, 0)",
                    params![ROOT_INODE, ItemType::Directory.code(), 0o755u16, now, nowns],
                )?;
                // "shared" pseudo-directory: read-only listing surface.
                tx.execute(
                    "INSERT INTO nsfs_node (inode, type, mode, atime, mtime, ctime,
                                            atimensec, mtimensec, ctimensec,
                                            nlink, length, rdev, parent, owner)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?5, ?5, ?5, 2, 4096, 0, ?6, 0)",
                    params![
                        SHARED_INODE,
                        ItemType::Directory.code(),
                        0o555u16,
                        now,
                        nowns,
                        ROOT_INODE
                    ],
                )?;
                // The one plaintext edge in the tree, by convention.
                tx.execute(
                    "INSERT INTO nsfs_edge (parent, name, inode, type, key)
                     VALUES (?1, ?2, ?3, ?4, X'')",
                    params![
                        ROOT_INODE,
                        SHARED_NAME.as_bytes(),
                        SHARED_INODE,
                        ItemType::Directory.code()
                    ],
                )?;
            } else {
                tx.execute(
                    "UPDATE nsfs_setting SET value = ?1 WHERE name = 'format'",
                    params![data],
                )?;
            }
            Ok(())
        })
    }

    /// Load the format record; an unformatted volume is an error.
    pub fn load_format(&self) -> Result<Format, FsError> {
        let raw: Option<String> = self.ro_txn(|conn| {
            let table: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name='nsfs_setting'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if table.is_none() {
                return Ok(None);
            }
            Ok(conn
                .query_row(
                    "SELECT value FROM nsfs_setting WHERE name = 'format'",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match raw {
            Some(raw) => Format::from_json(&raw),
            None => Err(FsError::Storage(
                "database is not formatted, run `netsecfs init` first".into(),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // User management
    // -----------------------------------------------------------------------

    /// `AlreadyExists` when the username is taken.
    pub fn check_user(&self, username: &str) -> Result<(), FsError> {
        self.ro_txn(|conn| {
            let id: Option<u32> = conn
                .query_row(
                    "SELECT id FROM nsfs_user WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(_) => Err(FsError::AlreadyExists),
                None => Ok(()),
            }
        })
    }

    pub fn create_user(
        &self,
        username: &str,
        pwd_hash: &[u8],
        salt: &[u8],
        wrapped_root: &[u8],
        wrapped_priv: &[u8],
        pub_key: &[u8],
    ) -> Result<u32, FsError> {
        self.txn(|tx| {
            tx.execute(
                "INSERT INTO nsfs_user (username, password, salt, root_key, pr_key, pub_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![username, pwd_hash, salt, wrapped_root, wrapped_priv, pub_key],
            )?;
            Ok(tx.last_insert_rowid() as u32)
        })
    }

    /// Constant-time digest check. Returns the wrapped root key and wrapped
    /// private key; any mismatch or unknown user is `AuthFailed`.
    pub fn verify_user(
        &self,
        username: &str,
        pwd_hash: &[u8],
    ) -> Result<(u32, Vec<u8>, Vec<u8>), FsError> {
        self.ro_txn(|conn| {
            let row: Option<(u32, Vec<u8>, Vec<u8>, Vec<u8>)> = conn
                .query_row(
                    "SELECT id, password, root_key, pr_key FROM nsfs_user WHERE username = ?1",
                    params![username],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let (id, stored, wrapped_root, wrapped_priv) = row.ok_or(FsError::AuthFailed)?;
            if stored.len() != pwd_hash.len() || stored.ct_eq(pwd_hash).unwrap_u8() != 1 {
                return Err(FsError::AuthFailed);
            }
            Ok((id, wrapped_root, wrapped_priv))
        })
    }

    pub fn get_salt(&self, username: &str) -> Result<Vec<u8>, FsError> {
        self.ro_txn(|conn| {
            let salt: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT salt FROM nsfs_user WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            salt.ok_or(FsError::NotFound)
        })
    }

    pub fn change_password(
        &self,
        username: &str,
        pwd_hash: &[u8],
        salt: &[u8],
        wrapped_root: &[u8],
        wrapped_priv: &[u8],
    ) -> Result<(), FsError> {
        self.txn(|tx| {
            let changed = tx.execute(
                "UPDATE nsfs_user SET password = ?2, salt = ?3, root_key = ?4, pr_key = ?5
                 WHERE username = ?1",
                params![username, pwd_hash, salt, wrapped_root, wrapped_priv],
            )?;
            if changed == 0 {
                return Err(FsError::NotFound);
            }
            Ok(())
        })
    }

    pub fn get_user_id(&self, username: &str) -> Result<u32, FsError> {
        self.ro_txn(|conn| {
            let id: Option<u32> = conn
                .query_row(
                    "SELECT id FROM nsfs_user WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            id.ok_or(FsError::NotFound)
        })
    }

    pub fn get_public_key(&self, username: &str) -> Result<Vec<u8>, FsError> {
        self.ro_txn(|conn| {
            let key: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT pub_key FROM nsfs_user WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            key.ok_or(FsError::NotFound)
        })
    }

    // -----------------------------------------------------------------------
    // Namespace
    // -----------------------------------------------------------------------

    pub fn get_attr(&self, inode: Ino) -> Result<Attr, FsError> {
        self.ro_txn(|conn| get_node(conn, inode))
    }

    /// Confirm that `inode` is visible as a child of `parent` for this user
    /// and return its attributes. Children of the shared pseudo-directory
    /// resolve through the share table.
    pub fn lookup(&self, user_id: u32, parent: Ino, inode: Ino) -> Result<Attr, FsError> {
        self.ro_txn(|conn| {
            let visible: Option<Ino> = if parent == SHARED_INODE {
                conn.query_row(
                    "SELECT inode FROM nsfs_shared WHERE user = ?1 AND inode = ?2",
                    params![user_id, inode],
                    |row| row.get(0),
                )
                .optional()?
            } else {
                conn.query_row(
                    "SELECT inode FROM nsfs_edge WHERE parent = ?1 AND inode = ?2",
                    params![parent, inode],
                    |row| row.get(0),
                )
                .optional()?
            };
            if visible.is_none() {
                return Err(FsError::NotFound);
            }
            get_node(conn, inode)
        })
    }

    /// Only time fields are mutable. Mode/uid/gid changes are silently
    /// ignored; setting an absolute time needs uid 0.
    pub fn set_attr(&self, inode: Ino, mask: &SetAttrMask, ctx_uid: u32) -> Result<Attr, FsError> {
        if mask.has_absolute_time() && ctx_uid != 0 {
            return Err(FsError::PermissionDenied);
        }
        if mask.is_empty() {
            return self.get_attr(inode);
        }
        let mask = *mask;
        self.txn(move |tx| {
            get_node(tx, inode)?;
            let (now, nowns) = now_micros();
            let (atime, atimensec) = if mask.atime_now {
                (Some(now), nowns)
            } else if let Some((sec, nsec)) = mask.atime {
                (Some(sec * 1_000_000 + (nsec as i64) / 1000), (nsec as i64) % 1000)
            } else {
                (None, 0)
            };
            let (mtime, mtimensec) = if mask.mtime_now {
                (Some(now), nowns)
            } else if let Some((sec, nsec)) = mask.mtime {
                (Some(sec * 1_000_000 + (nsec as i64) / 1000), (nsec as i64) % 1000)
            } else {
                (None, 0)
            };
            if let Some(atime) = atime {
                tx.execute(
                    "UPDATE nsfs_node SET atime = ?2, atimensec = ?3, ctime = ?4, ctimensec = ?5
                     WHERE inode = ?1",
                    params![inode, atime, atimensec, now, nowns],
                )?;
            }
            if let Some(mtime) = mtime {
                tx.execute(
                    "UPDATE nsfs_node SET mtime = ?2, mtimensec = ?3, ctime = ?4, ctimensec = ?5
                     WHERE inode = ?1",
                    params![inode, mtime, mtimensec, now, nowns],
                )?;
            }
            get_node(tx, inode)
        })
    }

    /// Create a node under `parent`. The inode is allocated from the
    /// counter row inside the same transaction. `owner_hint` owns children
    /// of the root; deeper nodes inherit the parent's owner so shared
    /// subtrees stay attributed to the sharer.
    pub fn mknod(
        &self,
        parent: Ino,
        typ: ItemType,
        mode: u16,
        owner_hint: u32,
        name_ct: &[u8],
        wrapped_key: &[u8],
    ) -> Result<(Ino, Attr), FsError> {
        if parent == SHARED_INODE {
            return Err(FsError::PermissionDenied);
        }
        self.txn(|tx| {
            let pattr = get_node(tx, parent)?;
            if !pattr.is_dir() {
                return Err(FsError::NotDirectory);
            }
            let dup: Option<Ino> = tx
                .query_row(
                    "SELECT inode FROM nsfs_edge WHERE parent = ?1 AND name = ?2",
                    params![parent, name_ct],
                    |row| row.get(0),
                )
                .optional()?;
            if dup.is_some() {
                return Err(FsError::AlreadyExists);
            }

            let owner = if parent == ROOT_INODE {
                owner_hint
            } else {
                pattr.owner
            };
            let inode = alloc_inode(tx)?;
            let (now, nowns) = now_micros();
            let (nlink, length) = match typ {
                ItemType::Directory => (2u32, 4096u64),
                ItemType::File => (1u32, 0u64),
            };
            tx.execute(
                "INSERT INTO nsfs_node (inode, type, mode, atime, mtime, ctime,
                                        atimensec, mtimensec, ctimensec,
                                        nlink, length, rdev, parent, owner)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?5, ?5, ?5, ?6, ?7, 0, ?8, ?9)",
                params![
                    inode,
                    typ.code(),
                    mode & 0o7777,
                    now,
                    nowns,
                    nlink,
                    length,
                    parent,
                    owner
                ],
            )?;
            tx.execute(
                "INSERT INTO nsfs_edge (parent, name, inode, type, key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![parent, name_ct, inode, typ.code(), wrapped_key],
            )?;

            let parent_mtime_micros = pattr.mtime * 1_000_000 + (pattr.mtimensec as i64) / 1000;
            if typ == ItemType::Directory {
                tx.execute(
                    "UPDATE nsfs_node SET nlink = nlink + 1, mtime = ?2, ctime = ?2,
                                          mtimensec = ?3, ctimensec = ?3
                     WHERE inode = ?1",
                    params![parent, now, nowns],
                )?;
            } else if now - parent_mtime_micros >= SKIP_DIR_MTIME_MICROS {
                tx.execute(
                    "UPDATE nsfs_node SET mtime = ?2, ctime = ?2, mtimensec = ?3, ctimensec = ?3
                     WHERE inode = ?1",
                    params![parent, now, nowns],
                )?;
            }

            let attr = get_node(tx, inode)?;
            Ok((inode, attr))
        })
    }

    /// Remove an empty directory. Any share rows pointing at it die in the
    /// same transaction.
    pub fn rmdir(&self, parent: Ino, inode: Ino) -> Result<(), FsError> {
        if inode == ROOT_INODE || inode == SHARED_INODE {
            return Err(FsError::PermissionDenied);
        }
        self.txn(|tx| {
            let attr = get_node(tx, inode)?;
            if !attr.is_dir() {
                return Err(FsError::NotDirectory);
            }
            let child: Option<i64> = tx
                .query_row(
                    "SELECT id FROM nsfs_edge WHERE parent = ?1 LIMIT 1",
                    params![inode],
                    |row| row.get(0),
                )
                .optional()?;
            if child.is_some() {
                return Err(FsError::NotEmpty);
            }
            let removed = tx.execute(
                "DELETE FROM nsfs_edge WHERE parent = ?1 AND inode = ?2",
                params![parent, inode],
            )?;
            if removed == 0 {
                return Err(FsError::NotFound);
            }
            tx.execute("DELETE FROM nsfs_node WHERE inode = ?1", params![inode])?;
            tx.execute("DELETE FROM nsfs_shared WHERE inode = ?1", params![inode])?;
            let (now, nowns) = now_micros();
            tx.execute(
                "UPDATE nsfs_node SET nlink = nlink - 1, mtime = ?2, ctime = ?2,
                                      mtimensec = ?3, ctimensec = ?3
                 WHERE inode = ?1",
                params![parent, now, nowns],
            )?;
            Ok(())
        })
    }

    /// Remove a file entry. The caller deletes the blob in the same
    /// higher-level operation.
    pub fn unlink(&self, parent: Ino, inode: Ino) -> Result<(), FsError> {
        self.txn(|tx| {
            let attr = get_node(tx, inode)?;
            if attr.is_dir() {
                return Err(FsError::IsDirectory);
            }
            let removed = tx.execute(
                "DELETE FROM nsfs_edge WHERE parent = ?1 AND inode = ?2",
                params![parent, inode],
            )?;
            if removed == 0 {
                return Err(FsError::NotFound);
            }
            if attr.nlink <= 1 {
                tx.execute("DELETE FROM nsfs_node WHERE inode = ?1", params![inode])?;
            } else {
                tx.execute(
                    "UPDATE nsfs_node SET nlink = nlink - 1 WHERE inode = ?1",
                    params![inode],
                )?;
            }
            let (now, nowns) = now_micros();
            tx.execute(
                "UPDATE nsfs_node SET mtime = ?2, ctime = ?2, mtimensec = ?3, ctimensec = ?3
                 WHERE inode = ?1",
                params![parent, now, nowns],
            )?;
            Ok(())
        })
    }

    /// List a directory. The root shows the caller's own children plus the
    /// well-known "shared" edge; the shared pseudo-directory shows the
    /// caller's share rows; everything else shows all child edges.
    pub fn readdir(&self, inode: Ino, user_id: u32) -> Result<Vec<Entry>, FsError> {
        self.ro_txn(|conn| {
            let attr = get_node(conn, inode)?;
            if !attr.is_dir() {
                return Err(FsError::NotDirectory);
            }

            let (sql, bind): (&str, Vec<Box<dyn rusqlite::ToSql>>) = if inode == SHARED_INODE {
                (
                    "SELECT s.inode, s.name, s.key, n.type, n.mode, n.atime, n.mtime, n.ctime,
                            n.atimensec, n.mtimensec, n.ctimensec, n.nlink, n.length, n.rdev,
                            n.parent, n.owner
                     FROM nsfs_shared s INNER JOIN nsfs_node n ON s.inode = n.inode
                     WHERE s.user = ?1",
                    vec![Box::new(user_id)],
                )
            } else if inode == ROOT_INODE {
                (
                    "SELECT e.inode, e.name, e.key, n.type, n.mode, n.atime, n.mtime, n.ctime,
                            n.atimensec, n.mtimensec, n.ctimensec, n.nlink, n.length, n.rdev,
                            n.parent, n.owner
                     FROM nsfs_edge e INNER JOIN nsfs_node n ON e.inode = n.inode
                     WHERE e.parent = ?1 AND (n.owner = ?2 OR e.inode = ?3)",
                    vec![Box::new(inode), Box::new(user_id), Box::new(SHARED_INODE)],
                )
            } else {
                (
                    "SELECT e.inode, e.name, e.key, n.type, n.mode, n.atime, n.mtime, n.ctime,
                            n.atimensec, n.mtimensec, n.ctimensec, n.nlink, n.length, n.rdev,
                            n.parent, n.owner
                     FROM nsfs_edge e INNER JOIN nsfs_node n ON e.inode = n.inode
                     WHERE e.parent = ?1",
                    vec![Box::new(inode)],
                )
            };

            let mut stmt = conn.prepare(sql)?;
            let params: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params.as_slice(), |row| {
                let inode: Ino = row.get(0)?;
                let name: Vec<u8> = row.get(1)?;
                let key: Vec<u8> = row.get(2)?;
                let typ: u8 = row.get(3)?;
                let atime: i64 = row.get(5)?;
                let mtime: i64 = row.get(6)?;
                let ctime: i64 = row.get(7)?;
                let atimensec: i64 = row.get(8)?;
                let mtimensec: i64 = row.get(9)?;
                let ctimensec: i64 = row.get(10)?;
                Ok(Entry {
                    inode,
                    name,
                    key,
                    attr: Attr {
                        typ: ItemType::from_code(typ).unwrap_or(ItemType::File),
                        mode: row.get(4)?,
                        atime: atime.div_euclid(1_000_000),
                        mtime: mtime.div_euclid(1_000_000),
                        ctime: ctime.div_euclid(1_000_000),
                        atimensec: (atime.rem_euclid(1_000_000) * 1000 + atimensec) as u32,
                        mtimensec: (mtime.rem_euclid(1_000_000) * 1000 + mtimensec) as u32,
                        ctimensec: (ctime.rem_euclid(1_000_000) * 1000 + ctimensec) as u32,
                        nlink: row.get(11)?,
                        length: row.get(12)?,
                        rdev: row.get(13)?,
                        parent: row.get(14)?,
                        owner: row.get(15)?,
                    },
                })
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let entry = row?;
                if entry.name.is_empty() {
                    warn!(inode = entry.inode, parent = inode, "corrupt entry with empty name");
                    continue;
                }
                entries.push(entry);
            }
            Ok(entries)
        })
    }

    /// Record a content write: length grows to cover the spliced range,
    /// mtime moves to now. The ciphertext itself goes to the object store
    /// in the same higher-level operation.
    pub fn write(&self, inode: Ino, data_len: u64, off: u64) -> Result<(), FsError> {
        self.txn(|tx| {
            let attr = get_node(tx, inode)?;
            if attr.is_dir() {
                return Err(FsError::IsDirectory);
            }
            let new_len = attr.length.max(off + data_len);
            let (now, nowns) = now_micros();
            tx.execute(
                "UPDATE nsfs_node SET length = ?2, mtime = ?3, ctime = ?3,
                                      mtimensec = ?4, ctimensec = ?4
                 WHERE inode = ?1",
                params![inode, new_len, now, nowns],
            )?;
            Ok(())
        })
    }

    /// Set a file's length outright (ftruncate / O_TRUNC path).
    pub fn truncate(&self, inode: Ino, size: u64) -> Result<(), FsError> {
        self.txn(|tx| {
            let attr = get_node(tx, inode)?;
            if attr.is_dir() {
                return Err(FsError::IsDirectory);
            }
            let (now, nowns) = now_micros();
            tx.execute(
                "UPDATE nsfs_node SET length = ?2, mtime = ?3, ctime = ?3,
                                      mtimensec = ?4, ctimensec = ?4
                 WHERE inode = ?1",
                params![inode, size, now, nowns],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Key material
    // -----------------------------------------------------------------------

    /// Wrapped key of the edge whose child is `inode`.
    pub fn get_key(&self, inode: Ino) -> Result<Vec<u8>, FsError> {
        self.ro_txn(|conn| {
            let key: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT key FROM nsfs_edge WHERE inode = ?1",
                    params![inode],
                    |row| row.get(0),
                )
                .optional()?;
            key.ok_or(FsError::NotFound)
        })
    }

    /// RSA-wrapped key of the share row addressed to `user_id`.
    pub fn get_shared_key(&self, user_id: u32, inode: Ino) -> Result<Vec<u8>, FsError> {
        self.ro_txn(|conn| {
            let key: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT key FROM nsfs_shared WHERE user = ?1 AND inode = ?2",
                    params![user_id, inode],
                    |row| row.get(0),
                )
                .optional()?;
            key.ok_or(FsError::NotFound)
        })
    }

    /// Wrapped keys from `inode` up to (excluding) the root, child first.
    /// The caller unwraps in reverse starting from its root key.
    pub fn get_path_key(&self, inode: Ino) -> Result<Vec<Vec<u8>>, FsError> {
        self.ro_txn(|conn| {
            let mut keys = Vec::new();
            let mut cur = inode;
            for _ in 0..MAX_DEPTH {
                let row: Option<(Ino, Vec<u8>)> = conn
                    .query_row(
                        "SELECT parent, key FROM nsfs_edge WHERE inode = ?1",
                        params![cur],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (parent, key) = row.ok_or(FsError::NotFound)?;
                keys.push(key);
                if parent == ROOT_INODE {
                    return Ok(keys);
                }
                cur = parent;
            }
            Err(FsError::Storage("directory chain exceeds maximum depth".into()))
        })
    }

    // -----------------------------------------------------------------------
    // Sharing
    // -----------------------------------------------------------------------

    /// Insert a share row. Ownership of the shared subtree is proven by the
    /// caller's ability to produce `wrapped_key` at all, not checked here.
    pub fn share_dir(
        &self,
        grantee_id: u32,
        inode: Ino,
        name_ct: &[u8],
        wrapped_key: &[u8],
        owner_signature: &[u8],
    ) -> Result<(), FsError> {
        self.txn(|tx| {
            tx.execute(
                "INSERT INTO nsfs_shared (inode, name, user, key, sign)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![inode, name_ct, grantee_id, wrapped_key, owner_signature],
            )?;
            Ok(())
        })
    }

    /// The stored ownership signature for a share row.
    pub fn verify_share(&self, grantee_id: u32, inode: Ino) -> Result<Vec<u8>, FsError> {
        self.ro_txn(|conn| {
            let sig: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT sign FROM nsfs_shared WHERE user = ?1 AND inode = ?2",
                    params![grantee_id, inode],
                    |row| row.get(0),
                )
                .optional()?;
            sig.ok_or(FsError::NotFound)
        })
    }

    pub fn unshare_dir(&self, grantee_id: u32, inode: Ino) -> Result<(), FsError> {
        self.txn(|tx| {
            let removed = tx.execute(
                "DELETE FROM nsfs_shared WHERE user = ?1 AND inode = ?2",
                params![grantee_id, inode],
            )?;
            if removed == 0 {
                return Err(FsError::NotFound);
            }
            Ok(())
        })
    }
}
