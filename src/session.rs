//! Authenticated user session.
//!
//! Holds the plaintext master key, root key, and RSA private key in memory
//! only; nothing here is ever persisted unwrapped. Dropping the session
//! (logout) zeroizes the key material.

use std::path::Path;

use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::{aead, kdf, rsakeys, KdfParams};
use crate::error::FsError;
use crate::meta::{Ino, MetaStore, ROOT_INODE, SHARED_INODE};

pub struct Session {
    username: String,
    user_id: u32,
    master_key: Zeroizing<[u8; 32]>,
    root_key: Zeroizing<Vec<u8>>,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    kdf: KdfParams,
}

impl Session {
    // -----------------------------------------------------------------------
    // Account lifecycle
    // -----------------------------------------------------------------------

    /// Create an account and authenticate as it.
    ///
    /// Generates the user's 32-byte root key and 2048-bit RSA identity
    /// keypair; both are immutable for the lifetime of the account. Only
    /// their master-key-wrapped forms and the public key reach the store.
    pub fn signup(
        meta: &MetaStore,
        username: &str,
        password: &str,
        kdf_params: KdfParams,
    ) -> Result<Session, FsError> {
        if username.is_empty() || password.is_empty() {
            return Err(FsError::AuthFailed);
        }
        meta.check_user(username)?;

        let salt = kdf::generate_salt()?;
        let master_key = kdf::derive_master_key(&kdf_params, password.as_bytes(), &salt)?;
        let digest = kdf::password_digest(&*master_key);

        let root_key = Zeroizing::new(aead::generate_key()?.to_vec());
        let (private_key, public_key) = rsakeys::generate_keypair()?;
        let priv_der = rsakeys::private_key_der(&private_key)?;

        let wrapped_root = aead::encrypt(&*master_key, &root_key)?;
        let wrapped_priv = aead::encrypt(&*master_key, &priv_der)?;
        let pub_der = rsakeys::public_key_der(&public_key)?;

        let user_id = meta.create_user(
            username,
            &digest,
            &salt,
            &wrapped_root,
            &wrapped_priv,
            &pub_der,
        )?;
        info!(username, user_id, "user created");

        Ok(Session {
            username: username.to_string(),
            user_id,
            master_key,
            root_key,
            private_key,
            public_key,
            kdf: kdf_params,
        })
    }

    /// Authenticate an existing account and unwrap its key material.
    pub fn login(
        meta: &MetaStore,
        username: &str,
        password: &str,
        kdf_params: KdfParams,
    ) -> Result<Session, FsError> {
        if username.is_empty() || password.is_empty() {
            return Err(FsError::AuthFailed);
        }
        let salt = meta.get_salt(username).map_err(|_| FsError::AuthFailed)?;
        let master_key = kdf::derive_master_key(&kdf_params, password.as_bytes(), &salt)?;
        let digest = kdf::password_digest(&*master_key);

        let (user_id, wrapped_root, wrapped_priv) = meta.verify_user(username, &digest)?;

        let root_key = Zeroizing::new(aead::decrypt(&*master_key, &wrapped_root)?);
        let priv_der = Zeroizing::new(aead::decrypt(&*master_key, &wrapped_priv)?);
        let private_key = rsakeys::private_key_from_der(&priv_der)?;
        let public_key = RsaPublicKey::from(&private_key);
        info!(username, user_id, "login ok");

        Ok(Session {
            username: username.to_string(),
            user_id,
            master_key,
            root_key,
            private_key,
            public_key,
            kdf: kdf_params,
        })
    }

    /// Rotate the password wrapping. The root key and private key are
    /// re-wrapped, never regenerated, so existing ciphertext stays
    /// readable. The caller must be unmounted.
    pub fn change_password(&mut self, meta: &MetaStore, new_password: &str) -> Result<(), FsError> {
        if new_password.is_empty() {
            return Err(FsError::AuthFailed);
        }
        let salt = kdf::generate_salt()?;
        let master_key = kdf::derive_master_key(&self.kdf, new_password.as_bytes(), &salt)?;
        let digest = kdf::password_digest(&*master_key);

        let priv_der = rsakeys::private_key_der(&self.private_key)?;
        let wrapped_root = aead::encrypt(&*master_key, &self.root_key)?;
        let wrapped_priv = aead::encrypt(&*master_key, &priv_der)?;

        meta.change_password(&self.username, &digest, &salt, &wrapped_root, &wrapped_priv)?;
        self.master_key = master_key;
        info!(username = %self.username, "password changed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Derived master key; in memory for the life of the session only.
    pub fn master_key(&self) -> &[u8] {
        &*self.master_key
    }

    pub fn root_key(&self) -> &[u8] {
        &self.root_key
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    // -----------------------------------------------------------------------
    // Sharing
    // -----------------------------------------------------------------------

    /// Share the directory at `path` (relative to the mountpoint) with
    /// `grantee`. The inode comes from a stat on the live mount.
    pub fn share(
        &self,
        meta: &MetaStore,
        mountpoint: &Path,
        path: &str,
        grantee: &str,
    ) -> Result<(), FsError> {
        let (inode, name) = resolve_mounted_dir(mountpoint, path)?;
        self.share_inode(meta, inode, &name, grantee)
    }

    /// Revoke a share previously granted to `grantee`.
    pub fn unshare(
        &self,
        meta: &MetaStore,
        mountpoint: &Path,
        path: &str,
        grantee: &str,
    ) -> Result<(), FsError> {
        let (inode, name) = resolve_mounted_dir(mountpoint, path)?;
        self.unshare_inode(meta, inode, &name, grantee)
    }

    /// Core of the share protocol, addressable by inode for callers that
    /// already resolved one.
    ///
    /// Recovers the subtree's directory key by unwrapping the edge-key
    /// chain from the session root key; being able to do so at all is the
    /// ownership proof. The key is then RSA-wrapped for the grantee and
    /// the plaintext name signed with the owner's private key.
    pub fn share_inode(
        &self,
        meta: &MetaStore,
        inode: Ino,
        name: &str,
        grantee: &str,
    ) -> Result<(), FsError> {
        let grantee_id = meta.get_user_id(grantee)?;
        if grantee_id == self.user_id {
            return Err(FsError::PermissionDenied);
        }

        let dir_key = self.unwrap_path_key(meta, inode)?;
        let name_ct = aead::encrypt(&dir_key, name.as_bytes())?;
        let signature = rsakeys::sign(&self.private_key, name.as_bytes())?;

        let pub_der = meta.get_public_key(grantee)?;
        let grantee_pub = rsakeys::public_key_from_der(&pub_der)?;
        let wrapped_key = rsakeys::wrap(&grantee_pub, &dir_key)?;

        meta.share_dir(grantee_id, inode, &name_ct, &wrapped_key, &signature)?;
        info!(inode, grantee, "directory shared");
        Ok(())
    }

    /// Core of unshare. The stored signature must verify under the
    /// caller's own public key against the plaintext name; only the
    /// original sharer can revoke.
    pub fn unshare_inode(
        &self,
        meta: &MetaStore,
        inode: Ino,
        name: &str,
        grantee: &str,
    ) -> Result<(), FsError> {
        let grantee_id = meta.get_user_id(grantee)?;
        let signature = meta.verify_share(grantee_id, inode)?;
        rsakeys::verify(&self.public_key, name.as_bytes(), &signature)
            .map_err(|_| FsError::NotOwner)?;
        meta.unshare_dir(grantee_id, inode)?;
        info!(inode, grantee, "share revoked");
        Ok(())
    }

    /// Walk the wrapped-key chain for `inode` and unwrap it in reverse
    /// from the session root key, yielding the directory key.
    fn unwrap_path_key(&self, meta: &MetaStore, inode: Ino) -> Result<Zeroizing<Vec<u8>>, FsError> {
        let chain = meta.get_path_key(inode)?;
        let mut key = Zeroizing::new(self.root_key.to_vec());
        for wrapped in chain.iter().rev() {
            key = Zeroizing::new(aead::decrypt(&key, wrapped)?);
        }
        Ok(key)
    }
}

/// Stat `path` under the mountpoint and return (inode, final name
/// component). Only directories below the root are shareable.
fn resolve_mounted_dir(mountpoint: &Path, path: &str) -> Result<(Ino, String), FsError> {
    use std::os::unix::fs::MetadataExt;

    let rel = path.trim_start_matches('/');
    if rel.is_empty() {
        return Err(FsError::PermissionDenied);
    }
    let full = mountpoint.join(rel);
    let md = std::fs::metadata(&full).map_err(|_| FsError::NotFound)?;
    if !md.is_dir() {
        return Err(FsError::NotDirectory);
    }
    let inode = md.ino();
    if inode == ROOT_INODE || inode == SHARED_INODE {
        return Err(FsError::PermissionDenied);
    }
    let name = full
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(FsError::NotFound)?
        .to_string();
    Ok((inode, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::meta::ItemType;

    fn store() -> MetaStore {
        let store = MetaStore::open_in_memory().unwrap();
        let mut format = Format::new("testvol", ":memory:");
        store.init(&mut format).unwrap();
        store
    }

    fn kdf() -> KdfParams {
        KdfParams::insecure_test()
    }

    #[test]
    fn signup_then_login_recovers_keys() {
        let meta = store();
        let s1 = Session::signup(&meta, "alice", "pw", kdf()).unwrap();
        let root1 = s1.root_key().to_vec();
        let priv1 = s1.private_key().clone();
        drop(s1);

        let s2 = Session::login(&meta, "alice", "pw", kdf()).unwrap();
        assert_eq!(s2.root_key(), root1.as_slice());
        assert_eq!(s2.private_key(), &priv1);
    }

    #[test]
    fn wrong_password_fails_and_row_survives() {
        let meta = store();
        Session::signup(&meta, "alice", "pw", kdf()).unwrap();
        assert!(matches!(
            Session::login(&meta, "alice", "PW", kdf()),
            Err(FsError::AuthFailed)
        ));
        // The row is intact: the right password still works.
        assert!(Session::login(&meta, "alice", "pw", kdf()).is_ok());
    }

    #[test]
    fn empty_credentials_rejected() {
        let meta = store();
        assert!(matches!(
            Session::signup(&meta, "", "pw", kdf()),
            Err(FsError::AuthFailed)
        ));
        assert!(matches!(
            Session::signup(&meta, "alice", "", kdf()),
            Err(FsError::AuthFailed)
        ));
    }

    #[test]
    fn duplicate_signup_rejected() {
        let meta = store();
        Session::signup(&meta, "alice", "pw", kdf()).unwrap();
        assert!(matches!(
            Session::signup(&meta, "alice", "pw2", kdf()),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn password_change_rewraps_but_keeps_keys() {
        let meta = store();
        let mut s = Session::signup(&meta, "alice", "old", kdf()).unwrap();
        let root = s.root_key().to_vec();
        let private = s.private_key().clone();
        s.change_password(&meta, "new").unwrap();
        drop(s);

        assert!(matches!(
            Session::login(&meta, "alice", "old", kdf()),
            Err(FsError::AuthFailed)
        ));
        let s2 = Session::login(&meta, "alice", "new", kdf()).unwrap();
        assert_eq!(s2.root_key(), root.as_slice());
        assert_eq!(s2.private_key(), &private);
    }

    #[test]
    fn share_unshare_ownership() {
        let meta = store();
        let alice = Session::signup(&meta, "alice", "pw1", kdf()).unwrap();
        let bob = Session::signup(&meta, "bob", "pw2", kdf()).unwrap();

        // Alice creates a top-level directory the way the VFS would.
        let dir_key = aead::generate_key().unwrap();
        let name_ct = aead::encrypt(alice.root_key(), b"proj").unwrap();
        let wrapped = aead::encrypt(alice.root_key(), &dir_key).unwrap();
        let (inode, _) = meta
            .mknod(
                ROOT_INODE,
                ItemType::Directory,
                0o755,
                alice.user_id(),
                &name_ct,
                &wrapped,
            )
            .unwrap();

        alice.share_inode(&meta, inode, "proj", "bob").unwrap();

        // Bob sees the share and can recover the directory key.
        let entries = meta.readdir(SHARED_INODE, bob.user_id()).unwrap();
        assert_eq!(entries.len(), 1);
        let recovered = rsakeys::unwrap(bob.private_key(), &entries[0].key).unwrap();
        assert_eq!(recovered.as_slice(), &dir_key);
        let name = aead::decrypt(&recovered, &entries[0].name).unwrap();
        assert_eq!(name, b"proj");

        // Bob cannot revoke someone else's grant; Alice can.
        assert!(matches!(
            bob.unshare_inode(&meta, inode, "proj", "bob"),
            Err(FsError::NotOwner)
        ));
        alice.unshare_inode(&meta, inode, "proj", "bob").unwrap();
        assert!(meta.readdir(SHARED_INODE, bob.user_id()).unwrap().is_empty());
    }

    #[test]
    fn share_with_self_rejected() {
        let meta = store();
        let alice = Session::signup(&meta, "alice", "pw", kdf()).unwrap();
        let name_ct = aead::encrypt(alice.root_key(), b"d").unwrap();
        let wrapped = aead::encrypt(alice.root_key(), &aead::generate_key().unwrap()).unwrap();
        let (inode, _) = meta
            .mknod(
                ROOT_INODE,
                ItemType::Directory,
                0o755,
                alice.user_id(),
                &name_ct,
                &wrapped,
            )
            .unwrap();
        assert!(matches!(
            alice.share_inode(&meta, inode, "d", "alice"),
            Err(FsError::PermissionDenied)
        ));
    }
}
