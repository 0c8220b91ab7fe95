//! Filesystem operations through the adapter: content round-trips across
//! sessions, name secrecy at rest, tree guards, blob lifecycle.

use std::sync::Arc;

use netsecfs::crypto::KdfParams;
use netsecfs::{FsError, Format, MetaStore, NsFs, ObjectStore, Session, ROOT_INODE};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    meta_path: String,
    obj_path: String,
    meta: Arc<MetaStore>,
    objects: Arc<ObjectStore>,
}

fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let meta_path = dir.path().join("meta.db").to_string_lossy().into_owned();
    let obj_path = dir.path().join("obj.db").to_string_lossy().into_owned();
    let meta = Arc::new(MetaStore::open(&meta_path).unwrap());
    let mut format = Format::new("testvol", &obj_path);
    meta.init(&mut format).unwrap();
    let objects = Arc::new(ObjectStore::open(&obj_path).unwrap());
    Fixture {
        _dir: dir,
        meta_path,
        obj_path,
        meta,
        objects,
    }
}

fn kdf() -> KdfParams {
    KdfParams::insecure_test()
}

#[test]
fn content_roundtrip_across_sessions() {
    let fx = setup();

    // First session: build the tree and write.
    {
        let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);
        let (docs, _) = fs.do_mkdir(ROOT_INODE, "quarterly-reports", 0o755).unwrap();
        let (file, _) = fs.do_create(docs, "summary.txt", 0o644).unwrap();
        fs.do_write(file, 0, b"hello world").unwrap();
    }

    // Second session: log in again and read back through the name caches.
    let session = Session::login(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);
    let (docs, _) = fs.do_lookup(ROOT_INODE, "quarterly-reports").unwrap();
    let (file, attr) = fs.do_lookup(docs, "summary.txt").unwrap();
    assert_eq!(attr.length, 11);
    assert_eq!(fs.do_read(file, 0, 4096).unwrap(), b"hello world");
}

#[test]
fn no_plaintext_names_or_content_at_rest() {
    let fx = setup();
    {
        let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);
        let (docs, _) = fs.do_mkdir(ROOT_INODE, "quarterly-reports", 0o755).unwrap();
        let (file, _) = fs.do_create(docs, "summary.txt", 0o644).unwrap();
        fs.do_write(file, 0, b"the eagle lands at midnight").unwrap();
    }

    // Edge names are ciphertext.
    let conn = rusqlite::Connection::open(&fx.meta_path).unwrap();
    let mut stmt = conn.prepare("SELECT name FROM nsfs_edge").unwrap();
    let names: Vec<Vec<u8>> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert!(!names.iter().any(|n| n == b"quarterly-reports"));
    assert!(!names.iter().any(|n| n == b"summary.txt"));
    // Only the well-known edge is plaintext.
    assert_eq!(names.iter().filter(|n| n.as_slice() == b"shared").count(), 1);

    // Neither database file contains the plaintext anywhere.
    for path in [&fx.meta_path, &fx.obj_path] {
        let raw = std::fs::read(path).unwrap();
        let contains = |needle: &[u8]| raw.windows(needle.len()).any(|w| w == needle);
        assert!(!contains(b"quarterly-reports"), "{} leaks a name", path);
        assert!(!contains(b"summary.txt"), "{} leaks a name", path);
        assert!(
            !contains(b"the eagle lands at midnight"),
            "{} leaks content",
            path
        );
    }
}

#[test]
fn rmdir_of_populated_directory_leaves_tree_unchanged() {
    let fx = setup();
    let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);

    let (dir, _) = fs.do_mkdir(ROOT_INODE, "a", 0o755).unwrap();
    let (file, _) = fs.do_create(dir, "b", 0o644).unwrap();

    assert!(matches!(
        fs.do_rmdir(ROOT_INODE, "a"),
        Err(FsError::NotEmpty)
    ));
    assert!(fx.meta.get_attr(dir).is_ok());
    assert!(fx.meta.get_attr(file).is_ok());
    let (found, _) = fs.do_lookup(dir, "b").unwrap();
    assert_eq!(found, file);
}

#[test]
fn unlink_leaves_no_orphan_blob() {
    let fx = setup();
    let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);

    let (file, _) = fs.do_create(ROOT_INODE, "f", 0o644).unwrap();
    fs.do_write(file, 0, b"bytes").unwrap();
    fs.do_unlink(ROOT_INODE, "f").unwrap();

    let conn = rusqlite::Connection::open(&fx.obj_path).unwrap();
    let blobs: i64 = conn
        .query_row("SELECT COUNT(*) FROM nsfs_blob", [], |row| row.get(0))
        .unwrap();
    assert_eq!(blobs, 0);
    let conn = rusqlite::Connection::open(&fx.meta_path).unwrap();
    let nodes: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM nsfs_node WHERE inode = ?1",
            [file],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(nodes, 0);
}

#[test]
fn corrupting_one_byte_of_blob_data_fails_closed() {
    let fx = setup();
    let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);

    let (file, _) = fs.do_create(ROOT_INODE, "f", 0o644).unwrap();
    fs.do_write(file, 0, b"integrity matters").unwrap();

    {
        let conn = rusqlite::Connection::open(&fx.obj_path).unwrap();
        let data: Vec<u8> = conn
            .query_row("SELECT data FROM nsfs_blob WHERE inode = ?1", [file], |row| {
                row.get(0)
            })
            .unwrap();
        let mut corrupted = data.clone();
        corrupted[data.len() / 2] ^= 0x01;
        conn.execute(
            "UPDATE nsfs_blob SET data = ?2 WHERE inode = ?1",
            rusqlite::params![file, corrupted],
        )
        .unwrap();
    }

    match fs.do_read(file, 0, 4096) {
        Err(FsError::Crypto(_)) => {}
        other => panic!("expected crypto failure, got {:?}", other),
    }
}

#[test]
fn every_edge_key_unwraps_under_its_parent_key() {
    let fx = setup();
    let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);

    let (a, _) = fs.do_mkdir(ROOT_INODE, "a", 0o755).unwrap();
    let (b, _) = fs.do_mkdir(a, "b", 0o755).unwrap();
    let (c, _) = fs.do_mkdir(b, "c", 0o755).unwrap();

    // Depth k directory yields exactly k wrapped keys, and unwrapping in
    // reverse from the root key succeeds at every level.
    for (inode, depth) in [(a, 1usize), (b, 2), (c, 3)] {
        let chain = fx.meta.get_path_key(inode).unwrap();
        assert_eq!(chain.len(), depth);
        let mut key = session.root_key().to_vec();
        for wrapped in chain.iter().rev() {
            key = netsecfs::crypto::aead::decrypt(&key, wrapped).unwrap();
        }
        assert_eq!(key.len(), 32);
    }
}

#[test]
fn file_edge_carries_a_key_wrapped_by_the_directory_key() {
    let fx = setup();
    let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);

    let (docs, _) = fs.do_mkdir(ROOT_INODE, "docs", 0o755).unwrap();
    let (file, _) = fs.do_create(docs, "a.txt", 0o644).unwrap();

    // Recover the directory key from the chain, then check that the
    // file's edge key unwraps under it to a 32-byte data key.
    let mut dir_key = session.root_key().to_vec();
    for wrapped in fx.meta.get_path_key(docs).unwrap().iter().rev() {
        dir_key = netsecfs::crypto::aead::decrypt(&dir_key, wrapped).unwrap();
    }
    let wrapped_file_key = fx.meta.get_key(file).unwrap();
    let file_key = netsecfs::crypto::aead::decrypt(&dir_key, &wrapped_file_key).unwrap();
    assert_eq!(file_key.len(), 32);
}

#[test]
fn write_at_offset_preserves_earlier_bytes() {
    let fx = setup();
    let session = Session::signup(&fx.meta, "alice", "pw", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &session);

    let (file, _) = fs.do_create(ROOT_INODE, "f", 0o644).unwrap();
    fs.do_write(file, 0, b"0123456789").unwrap();
    fs.do_write(file, 4, b"xx").unwrap();
    assert_eq!(fs.do_read(file, 0, 4096).unwrap(), b"0123xx6789");
    assert_eq!(fx.meta.get_attr(file).unwrap().length, 10);
}
