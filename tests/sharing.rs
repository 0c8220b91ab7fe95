//! Share protocol end-to-end: grant, grantee traversal, revocation rules.

use std::sync::Arc;

use netsecfs::crypto::KdfParams;
use netsecfs::{FsError, Format, MetaStore, NsFs, ObjectStore, Session, ROOT_INODE, SHARED_INODE};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
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
        obj_path,
        meta,
        objects,
    }
}

fn kdf() -> KdfParams {
    KdfParams::insecure_test()
}

/// Alice creates proj/readme, shares proj with bob; bob reads the secret
/// through the shared pseudo-directory in a fresh session.
#[test]
fn grantee_traverses_and_reads_shared_subtree() {
    let fx = setup();
    let alice = Session::signup(&fx.meta, "alice", "pw1", kdf()).unwrap();
    Session::signup(&fx.meta, "bob", "pw2", kdf()).unwrap();

    let proj = {
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
        let (proj, _) = fs.do_mkdir(ROOT_INODE, "proj", 0o755).unwrap();
        let (readme, _) = fs.do_create(proj, "readme", 0o644).unwrap();
        fs.do_write(readme, 0, b"secret").unwrap();
        proj
    };
    alice.share_inode(&fx.meta, proj, "proj", "bob").unwrap();
    drop(alice);

    let bob = Session::login(&fx.meta, "bob", "pw2", kdf()).unwrap();
    let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &bob);

    let shared: Vec<String> = fs
        .list_dir(SHARED_INODE)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(shared, vec!["proj".to_string()]);

    let (proj_ino, _) = fs.do_lookup(SHARED_INODE, "proj").unwrap();
    let (readme_ino, _) = fs.do_lookup(proj_ino, "readme").unwrap();
    assert_eq!(fs.do_read(readme_ino, 0, 4096).unwrap(), b"secret");
}

#[test]
fn unshare_requires_ownership() {
    let fx = setup();
    let alice = Session::signup(&fx.meta, "alice", "pw1", kdf()).unwrap();
    let bob = Session::signup(&fx.meta, "bob", "pw2", kdf()).unwrap();

    let proj = {
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
        let (proj, _) = fs.do_mkdir(ROOT_INODE, "proj", 0o755).unwrap();
        proj
    };
    alice.share_inode(&fx.meta, proj, "proj", "bob").unwrap();

    // Bob is the grantee, not the sharer: the stored signature verifies
    // under alice's key only.
    assert!(matches!(
        bob.unshare_inode(&fx.meta, proj, "proj", "bob"),
        Err(FsError::NotOwner)
    ));
    let mut bob_fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &bob);
    assert_eq!(bob_fs.list_dir(SHARED_INODE).unwrap().len(), 1);

    alice.unshare_inode(&fx.meta, proj, "proj", "bob").unwrap();
    assert!(bob_fs.list_dir(SHARED_INODE).unwrap().is_empty());
}

#[test]
fn shared_listing_is_scoped_to_the_grantee() {
    let fx = setup();
    let alice = Session::signup(&fx.meta, "alice", "pw1", kdf()).unwrap();
    Session::signup(&fx.meta, "bob", "pw2", kdf()).unwrap();
    let carol = Session::signup(&fx.meta, "carol", "pw3", kdf()).unwrap();

    let proj = {
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
        let (proj, _) = fs.do_mkdir(ROOT_INODE, "proj", 0o755).unwrap();
        proj
    };
    alice.share_inode(&fx.meta, proj, "proj", "bob").unwrap();

    let mut carol_fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &carol);
    assert!(carol_fs.list_dir(SHARED_INODE).unwrap().is_empty());
}

#[test]
fn grantee_writes_keep_subtree_owner() {
    let fx = setup();
    let alice = Session::signup(&fx.meta, "alice", "pw1", kdf()).unwrap();
    Session::signup(&fx.meta, "bob", "pw2", kdf()).unwrap();

    let proj = {
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
        let (proj, _) = fs.do_mkdir(ROOT_INODE, "proj", 0o755).unwrap();
        proj
    };
    alice.share_inode(&fx.meta, proj, "proj", "bob").unwrap();

    let bob = Session::login(&fx.meta, "bob", "pw2", kdf()).unwrap();
    let mut bob_fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &bob);
    bob_fs.list_dir(SHARED_INODE).unwrap();
    let (note, attr) = bob_fs.do_create(proj, "note", 0o644).unwrap();
    // Ownership follows the subtree, so alice still sees the file.
    assert_eq!(attr.owner, alice.user_id());
    bob_fs.do_write(note, 0, b"from bob").unwrap();

    let mut alice_fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
    let (found, _) = alice_fs.do_lookup(proj, "note").unwrap();
    assert_eq!(alice_fs.do_read(found, 0, 4096).unwrap(), b"from bob");
}

#[test]
fn shared_content_stays_encrypted_at_rest() {
    let fx = setup();
    let alice = Session::signup(&fx.meta, "alice", "pw1", kdf()).unwrap();
    Session::signup(&fx.meta, "bob", "pw2", kdf()).unwrap();

    let proj = {
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
        let (proj, _) = fs.do_mkdir(ROOT_INODE, "proj", 0o755).unwrap();
        let (readme, _) = fs.do_create(proj, "readme", 0o644).unwrap();
        fs.do_write(readme, 0, b"attack at dawn, obviously").unwrap();
        proj
    };
    alice.share_inode(&fx.meta, proj, "proj", "bob").unwrap();

    let raw = std::fs::read(&fx.obj_path).unwrap();
    assert!(!raw
        .windows(b"attack at dawn, obviously".len())
        .any(|w| w == b"attack at dawn, obviously"));
}

#[test]
fn sharing_with_unknown_user_fails() {
    let fx = setup();
    let alice = Session::signup(&fx.meta, "alice", "pw1", kdf()).unwrap();
    let proj = {
        let mut fs = NsFs::new(fx.meta.clone(), fx.objects.clone(), &alice);
        let (proj, _) = fs.do_mkdir(ROOT_INODE, "proj", 0o755).unwrap();
        proj
    };
    assert!(matches!(
        alice.share_inode(&fx.meta, proj, "proj", "mallory"),
        Err(FsError::NotFound)
    ));
}
