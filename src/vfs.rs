//! VFS adapter: translates kernel filesystem callbacks into metadata,
//! object-store, and crypto calls.
//!
//! The adapter owns the two caches that bridge the kernel's name-based
//! calls and the ciphertext-only database: a per-directory plaintext-name
//! to inode map, rebuilt from every listing, and a directory-key cache
//! filled as the tree is traversed. The fuser `Filesystem` impl itself is
//! a thin errno shim over the `do_*` operation cores, which are directly
//! testable without a kernel mount.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use rsa::RsaPrivateKey;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::crypto::{aead, rsakeys};
use crate::error::FsError;
use crate::format::BLOCK_SIZE;
use crate::meta::{
    Attr, Ino, ItemType, MetaStore, SetAttrMask, MAX_NAME, ROOT_INODE, SHARED_INODE, SHARED_NAME,
};
use crate::object::ObjectStore;
use crate::session::Session;

const TTL: Duration = Duration::from_secs(1);

/// Advertised capacity for statfs: 1 TiB.
const ADVERTISED_BYTES: u64 = 1 << 40;

/// A decrypted directory listing row.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub inode: Ino,
    pub typ: ItemType,
    pub name: String,
}

pub struct NsFs {
    meta: Arc<MetaStore>,
    objects: Arc<ObjectStore>,
    user_id: u32,
    root_key: Zeroizing<Vec<u8>>,
    private_key: RsaPrivateKey,
    uid: u32,
    gid: u32,
    /// parent inode -> plaintext child name -> child inode.
    names: HashMap<Ino, HashMap<String, Ino>>,
    /// directory inode -> directory key.
    dir_keys: HashMap<Ino, Zeroizing<Vec<u8>>>,
}

impl NsFs {
    pub fn new(meta: Arc<MetaStore>, objects: Arc<ObjectStore>, session: &Session) -> Self {
        let root_key = Zeroizing::new(session.root_key().to_vec());
        let mut dir_keys = HashMap::new();
        dir_keys.insert(ROOT_INODE, root_key.clone());
        Self {
            meta,
            objects,
            user_id: session.user_id(),
            root_key,
            private_key: session.private_key().clone(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            names: HashMap::new(),
            dir_keys,
        }
    }

    // -----------------------------------------------------------------------
    // Attribute translation
    // -----------------------------------------------------------------------

    fn timestamp(sec: i64, nsec: u32) -> SystemTime {
        if sec >= 0 {
            UNIX_EPOCH + Duration::new(sec as u64, nsec)
        } else {
            UNIX_EPOCH - Duration::new((-sec) as u64, 0)
        }
    }

    /// uid/gid are a display convention: the mounting user everywhere,
    /// except the root which reports 0/0. The database stores neither.
    fn fuse_attr(&self, inode: Ino, attr: &Attr) -> FileAttr {
        let (uid, gid) = if inode == ROOT_INODE {
            (0, 0)
        } else {
            (self.uid, self.gid)
        };
        FileAttr {
            ino: inode,
            size: attr.length,
            blocks: (attr.length + 511) / 512,
            atime: Self::timestamp(attr.atime, attr.atimensec),
            mtime: Self::timestamp(attr.mtime, attr.mtimensec),
            ctime: Self::timestamp(attr.ctime, attr.ctimensec),
            crtime: Self::timestamp(attr.ctime, attr.ctimensec),
            kind: match attr.typ {
                ItemType::Directory => FileType::Directory,
                ItemType::File => FileType::RegularFile,
            },
            perm: attr.mode,
            nlink: attr.nlink,
            uid,
            gid,
            rdev: attr.rdev,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Key and name caches
    // -----------------------------------------------------------------------

    /// Directory key for `inode`: cache hit, or recovered by unwrapping the
    /// edge-key chain from the session root key. Keys for shared subtrees
    /// enter the cache when the "shared" listing RSA-unwraps them; the
    /// chain walk only works for the caller's own tree.
    fn dir_key(&mut self, inode: Ino) -> Result<Zeroizing<Vec<u8>>, FsError> {
        if let Some(key) = self.dir_keys.get(&inode) {
            return Ok(key.clone());
        }
        // A grant reaches directories whose chain the session root key
        // cannot unwrap; a share row addressed to this user wins.
        if let Ok(wrapped) = self.meta.get_shared_key(self.user_id, inode) {
            let key = Zeroizing::new(rsakeys::unwrap(&self.private_key, &wrapped)?.to_vec());
            self.dir_keys.insert(inode, key.clone());
            return Ok(key);
        }
        let chain = self.meta.get_path_key(inode)?;
        let mut key = self.root_key.clone();
        for wrapped in chain.iter().rev() {
            key = Zeroizing::new(aead::decrypt(&key, wrapped)?);
        }
        self.dir_keys.insert(inode, key.clone());
        Ok(key)
    }

    /// Decrypt a directory listing, rebuilding the name cache for `inode`
    /// and absorbing child directory keys along the way.
    pub fn list_dir(&mut self, inode: Ino) -> Result<Vec<DirEntry>, FsError> {
        let entries = self.meta.readdir(inode, self.user_id)?;
        let mut out = Vec::with_capacity(entries.len());
        let mut map = HashMap::with_capacity(entries.len());

        if inode == SHARED_INODE {
            for entry in entries {
                let dir_key = rsakeys::unwrap(&self.private_key, &entry.key)?;
                let name_bytes = aead::decrypt(&dir_key, &entry.name)?;
                let name = String::from_utf8(name_bytes)
                    .map_err(|_| FsError::Crypto(crate::error::CryptoError::BadTag))?;
                self.dir_keys.insert(entry.inode, Zeroizing::new(dir_key.to_vec()));
                map.insert(name.clone(), entry.inode);
                out.push(DirEntry {
                    inode: entry.inode,
                    typ: entry.attr.typ,
                    name,
                });
            }
        } else {
            let key = self.dir_key(inode)?;
            for entry in entries {
                // The well-known "shared" edge is plaintext by convention.
                let edge_key: &[u8] = if inode == ROOT_INODE && entry.inode == SHARED_INODE {
                    b""
                } else {
                    &key
                };
                let name_bytes = aead::decrypt(edge_key, &entry.name)?;
                let name = String::from_utf8(name_bytes)
                    .map_err(|_| FsError::Crypto(crate::error::CryptoError::BadTag))?;
                if entry.attr.typ == ItemType::Directory && !entry.key.is_empty() {
                    let child_key = aead::decrypt(&key, &entry.key)?;
                    self.dir_keys.insert(entry.inode, Zeroizing::new(child_key));
                }
                map.insert(name.clone(), entry.inode);
                out.push(DirEntry {
                    inode: entry.inode,
                    typ: entry.attr.typ,
                    name,
                });
            }
        }

        self.names.insert(inode, map);
        Ok(out)
    }

    fn cached_child(&mut self, parent: Ino, name: &str) -> Result<Option<Ino>, FsError> {
        if !self.names.contains_key(&parent) {
            self.list_dir(parent)?;
        }
        Ok(self.names.get(&parent).and_then(|m| m.get(name)).copied())
    }

    fn check_name(name: &OsStr) -> Result<&str, FsError> {
        let name = name.to_str().ok_or(FsError::NotFound)?;
        if name.len() > MAX_NAME {
            return Err(FsError::NameTooLong);
        }
        Ok(name)
    }

    // -----------------------------------------------------------------------
    // Operation cores
    // -----------------------------------------------------------------------

    pub fn do_lookup(&mut self, parent: Ino, name: &str) -> Result<(Ino, Attr), FsError> {
        let inode = self.cached_child(parent, name)?.ok_or(FsError::NotFound)?;
        let attr = self.meta.lookup(self.user_id, parent, inode)?;
        Ok((inode, attr))
    }

    pub fn do_mkdir(&mut self, parent: Ino, name: &str, mode: u16) -> Result<(Ino, Attr), FsError> {
        if self.cached_child(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let parent_key = self.dir_key(parent)?;
        let dir_key = aead::generate_key()?;
        let name_ct = aead::encrypt(&parent_key, name.as_bytes())?;
        let wrapped = aead::encrypt(&parent_key, &dir_key)?;
        let (inode, attr) =
            self.meta
                .mknod(parent, ItemType::Directory, mode, self.user_id, &name_ct, &wrapped)?;
        self.dir_keys.insert(inode, Zeroizing::new(dir_key.to_vec()));
        if let Some(map) = self.names.get_mut(&parent) {
            map.insert(name.to_string(), inode);
        }
        Ok((inode, attr))
    }

    pub fn do_create(&mut self, parent: Ino, name: &str, mode: u16) -> Result<(Ino, Attr), FsError> {
        if self.cached_child(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let parent_key = self.dir_key(parent)?;
        let file_key = aead::generate_key()?;
        let name_ct = aead::encrypt(&parent_key, name.as_bytes())?;
        let wrapped = aead::encrypt(&parent_key, &file_key)?;
        let (inode, attr) =
            self.meta
                .mknod(parent, ItemType::File, mode, self.user_id, &name_ct, &wrapped)?;
        if let Some(map) = self.names.get_mut(&parent) {
            map.insert(name.to_string(), inode);
        }
        Ok((inode, attr))
    }

    pub fn do_unlink(&mut self, parent: Ino, name: &str) -> Result<(), FsError> {
        let inode = self.cached_child(parent, name)?.ok_or(FsError::NotFound)?;
        self.meta.unlink(parent, inode)?;
        self.objects.delete(inode)?;
        if let Some(map) = self.names.get_mut(&parent) {
            map.remove(name);
        }
        Ok(())
    }

    pub fn do_rmdir(&mut self, parent: Ino, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::PermissionDenied);
        }
        if parent == ROOT_INODE && name == SHARED_NAME {
            return Err(FsError::PermissionDenied);
        }
        let inode = self.cached_child(parent, name)?.ok_or(FsError::NotFound)?;
        self.meta.rmdir(parent, inode)?;
        self.names.remove(&inode);
        self.dir_keys.remove(&inode);
        if let Some(map) = self.names.get_mut(&parent) {
            map.remove(name);
        }
        Ok(())
    }

    /// Decrypt the whole file: blob get, unwrap the content key under the
    /// containing directory's key, open the ciphertext. A missing blob is
    /// an empty file.
    fn read_plaintext(&mut self, inode: Ino) -> Result<Zeroizing<Vec<u8>>, FsError> {
        let blob = match self.objects.get(inode) {
            Ok(blob) => blob,
            Err(FsError::NotFound) => return Ok(Zeroizing::new(Vec::new())),
            Err(e) => return Err(e),
        };
        let parent = self.meta.get_attr(inode)?.parent;
        let parent_key = self.dir_key(parent)?;
        let content_key = Zeroizing::new(aead::decrypt(&parent_key, &blob.wrapped_key)?);
        Ok(Zeroizing::new(aead::decrypt(&content_key, &blob.ciphertext)?))
    }

    /// Encrypt and store the whole file under a fresh content key.
    fn write_plaintext(&mut self, inode: Ino, plaintext: &[u8]) -> Result<(), FsError> {
        let parent = self.meta.get_attr(inode)?.parent;
        let parent_key = self.dir_key(parent)?;
        let content_key = Zeroizing::new(aead::generate_key()?.to_vec());
        let ciphertext = aead::encrypt(&content_key, plaintext)?;
        let wrapped = aead::encrypt(&parent_key, &content_key)?;
        self.objects
            .put(inode, &wrapped, &ciphertext, plaintext.len() as u64)
    }

    pub fn do_read(&mut self, inode: Ino, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let plaintext = self.read_plaintext(inode)?;
        let len = plaintext.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = len.min(offset + size as u64);
        Ok(plaintext[offset as usize..end as usize].to_vec())
    }

    /// Whole-file replace: splice the incoming bytes into the decrypted
    /// plaintext (zero-filling any gap past the old end), then re-encrypt
    /// everything under a fresh content key.
    pub fn do_write(&mut self, inode: Ino, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let mut plaintext = self.read_plaintext(inode)?;
        let end = offset as usize + data.len();
        if plaintext.len() < end {
            plaintext.resize(end, 0);
        }
        plaintext[offset as usize..end].copy_from_slice(data);
        self.write_plaintext(inode, &plaintext)?;
        self.meta.write(inode, data.len() as u64, offset)?;
        Ok(data.len() as u32)
    }

    /// ftruncate / O_TRUNC: shrink or zero-extend the plaintext.
    pub fn do_truncate(&mut self, inode: Ino, size: u64) -> Result<(), FsError> {
        if size == 0 {
            self.objects.delete(inode)?;
        } else {
            let mut plaintext = self.read_plaintext(inode)?;
            plaintext.resize(size as usize, 0);
            self.write_plaintext(inode, &plaintext)?;
        }
        self.meta.truncate(inode, size)
    }

    fn do_setattr(
        &mut self,
        inode: Ino,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctx_uid: u32,
    ) -> Result<Attr, FsError> {
        if let Some(size) = size {
            self.do_truncate(inode, size)?;
        }
        let mut mask = SetAttrMask::default();
        match atime {
            Some(TimeOrNow::Now) => mask.atime_now = true,
            Some(TimeOrNow::SpecificTime(t)) => mask.atime = Some(split_systime(t)),
            None => {}
        }
        match mtime {
            Some(TimeOrNow::Now) => mask.mtime_now = true,
            Some(TimeOrNow::SpecificTime(t)) => mask.mtime = Some(split_systime(t)),
            None => {}
        }
        self.meta.set_attr(inode, &mask, ctx_uid)
    }
}

fn split_systime(t: SystemTime) -> (i64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

// ---------------------------------------------------------------------------
// fuser shim
// ---------------------------------------------------------------------------

impl Filesystem for NsFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match Self::check_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        match self.do_lookup(parent, name) {
            Ok((inode, attr)) => reply.entry(&TTL, &self.fuse_attr(inode, &attr), 0),
            Err(e) => {
                debug!(parent, name, error = %e, "lookup failed");
                reply.error(e.errno())
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.meta.get_attr(ino) {
            Ok(attr) => reply.attr(&TTL, &self.fuse_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // mode/uid/gid are not persisted; requests to change them are
        // silently ignored.
        match self.do_setattr(ino, size, atime, mtime, req.uid()) {
            Ok(attr) => reply.attr(&TTL, &self.fuse_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match Self::check_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let mode = (mode & !umask & 0o7777) as u16;
        match self.do_mkdir(parent, name, mode) {
            Ok((inode, attr)) => reply.entry(&TTL, &self.fuse_attr(inode, &attr), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::check_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::check_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.meta.get_attr(ino) {
            Ok(attr) => {
                if !attr.is_dir() && flags & libc::O_TRUNC != 0 {
                    if let Err(e) = self.do_truncate(ino, 0) {
                        return reply.error(e.errno());
                    }
                }
                reply.opened(ino, 0)
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(ino, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!(ino, error = %e, "read failed");
                reply.error(e.errno())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.do_write(ino, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                error!(ino, error = %e, "write failed");
                reply.error(e.errno())
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok()
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok()
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok()
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let parent = match self.meta.get_attr(ino) {
            Ok(attr) => attr.parent,
            Err(e) => return reply.error(e.errno()),
        };
        let listing = match self.list_dir(ino) {
            Ok(listing) => listing,
            Err(e) => {
                error!(ino, error = %e, "readdir failed");
                return reply.error(e.errno());
            }
        };

        let mut all: Vec<(Ino, FileType, String)> = Vec::with_capacity(listing.len() + 2);
        all.push((ino, FileType::Directory, ".".to_string()));
        all.push((parent, FileType::Directory, "..".to_string()));
        for entry in listing {
            let kind = match entry.typ {
                ItemType::Directory => FileType::Directory,
                ItemType::File => FileType::RegularFile,
            };
            all.push((entry.inode, kind, entry.name));
        }

        for (i, (inode, kind, name)) in all.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(inode, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok()
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let blocks = ADVERTISED_BYTES / BLOCK_SIZE as u64;
        reply.statfs(
            blocks,
            blocks,
            blocks,
            1 << 20,
            1 << 20,
            BLOCK_SIZE,
            MAX_NAME as u32,
            BLOCK_SIZE,
        )
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match Self::check_name(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.errno()),
        };
        let mode = (mode & !umask & 0o7777) as u16;
        match self.do_create(parent, name, mode) {
            Ok((inode, attr)) => {
                reply.created(&TTL, &self.fuse_attr(inode, &attr), 0, inode, 0)
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}

// ---------------------------------------------------------------------------
// Mounting
// ---------------------------------------------------------------------------

/// Mount the filesystem for an authenticated session in a background
/// thread. Dropping the returned session unmounts.
pub fn mount(
    meta: Arc<MetaStore>,
    objects: Arc<ObjectStore>,
    session: &Session,
    mountpoint: &Path,
) -> io::Result<fuser::BackgroundSession> {
    let fs = NsFs::new(meta, objects, session);
    let options = [
        MountOption::FSName("netsecfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::RW,
    ];
    info!(mountpoint = %mountpoint.display(), "mounting netsecfs");
    fuser::spawn_mount2(fs, mountpoint, &options)
}
