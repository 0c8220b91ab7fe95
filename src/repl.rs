//! Interactive console: sequences signup/login/mount/share for one user.
//!
//! The console owns the session and the background mount. Verbs that stat
//! paths (share/unshare) need the filesystem mounted; password changes
//! need it unmounted.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use crate::crypto::KdfParams;
use crate::format::Format;
use crate::meta::MetaStore;
use crate::object::ObjectStore;
use crate::session::Session;
use crate::vfs;

const HELP: &str = "\
commands:
  signup <user> <password>   create an account and log in
  login <user> <password>    log in
  logout                     drop the session (unmounts first)
  passwd <new-password>      change password (must be unmounted)
  mount                      mount the filesystem
  umount                     unmount the filesystem
  share <path> <user>        share a directory with another user
  unshare <path> <user>      revoke a share you granted
  help                       this text
  exit                       unmount, log out and quit";

pub struct Console {
    meta: Arc<MetaStore>,
    format: Format,
    mountpoint: PathBuf,
    kdf: KdfParams,
    session: Option<Session>,
    mounted: Option<fuser::BackgroundSession>,
}

impl Console {
    pub fn new(meta: Arc<MetaStore>, format: Format, mountpoint: PathBuf) -> Self {
        Self {
            meta,
            format,
            mountpoint,
            kdf: KdfParams::default(),
            session: None,
            mounted: None,
        }
    }

    /// Read-eval loop over stdin. Returns on `exit` or EOF.
    pub fn run(&mut self) {
        let stdin = io::stdin();
        loop {
            print!("> ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    break;
                }
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if words[0] == "exit" {
                break;
            }
            self.dispatch(&words);
        }
        self.unmount();
        self.session = None;
        println!("bye");
    }

    fn dispatch(&mut self, words: &[&str]) {
        match words {
            ["help"] => println!("{}", HELP),
            ["signup", user, password] => self.signup(user, password),
            ["login", user, password] => self.login(user, password),
            ["logout"] => self.logout(),
            ["passwd", new_password] => self.passwd(new_password),
            ["mount"] => self.mount(),
            ["umount"] => self.umount(),
            ["share", path, user] => self.share(path, user),
            ["unshare", path, user] => self.unshare(path, user),
            _ => println!("unknown or malformed command, try `help`"),
        }
    }

    fn signup(&mut self, user: &str, password: &str) {
        if self.session.is_some() {
            println!("already logged in, `logout` first");
            return;
        }
        match Session::signup(&self.meta, user, password, self.kdf) {
            Ok(session) => {
                println!("user {} created and logged in", session.username());
                self.session = Some(session);
            }
            Err(e) => println!("signup failed: {}", e),
        }
    }

    fn login(&mut self, user: &str, password: &str) {
        if self.session.is_some() {
            println!("already logged in, `logout` first");
            return;
        }
        match Session::login(&self.meta, user, password, self.kdf) {
            Ok(session) => {
                println!("logged in as {}", session.username());
                self.session = Some(session);
            }
            Err(e) => println!("login failed: {}", e),
        }
    }

    fn logout(&mut self) {
        self.unmount();
        // Dropping the session zeroizes its key material.
        if self.session.take().is_some() {
            println!("logged out");
        } else {
            println!("not logged in");
        }
    }

    fn passwd(&mut self, new_password: &str) {
        if self.mounted.is_some() {
            println!("unmount before changing the password");
            return;
        }
        match self.session.as_mut() {
            Some(session) => match session.change_password(&self.meta, new_password) {
                Ok(()) => println!("password changed"),
                Err(e) => println!("passwd failed: {}", e),
            },
            None => println!("not logged in"),
        }
    }

    fn mount(&mut self) {
        if self.mounted.is_some() {
            println!("already mounted on {}", self.mountpoint.display());
            return;
        }
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => {
                println!("not logged in");
                return;
            }
        };
        let objects = match ObjectStore::open(&self.format.storage) {
            Ok(objects) => Arc::new(objects),
            Err(e) => {
                println!("cannot open object database: {}", e);
                return;
            }
        };
        match vfs::mount(self.meta.clone(), objects, session, &self.mountpoint) {
            Ok(background) => {
                self.mounted = Some(background);
                println!("mounted on {}, `umount` to stop", self.mountpoint.display());
            }
            Err(e) => println!("mount failed: {}", e),
        }
    }

    fn umount(&mut self) {
        if self.mounted.is_none() {
            println!("not mounted");
            return;
        }
        self.unmount();
        println!("unmounted");
    }

    fn unmount(&mut self) {
        // Dropping the background session tears the mount down; in-flight
        // callbacks complete first.
        self.mounted.take();
    }

    fn share(&mut self, path: &str, user: &str) {
        if self.mounted.is_none() {
            println!("mount before sharing");
            return;
        }
        match self.session.as_ref() {
            Some(session) => match session.share(&self.meta, &self.mountpoint, path, user) {
                Ok(()) => println!("shared {} with {}", path, user),
                Err(e) => println!("share failed: {}", e),
            },
            None => println!("not logged in"),
        }
    }

    fn unshare(&mut self, path: &str, user: &str) {
        if self.mounted.is_none() {
            println!("mount before unsharing");
            return;
        }
        match self.session.as_ref() {
            Some(session) => match session.unshare(&self.meta, &self.mountpoint, path, user) {
                Ok(()) => println!("unshared {} from {}", path, user),
                Err(e) => println!("unshare failed: {}", e),
            },
            None => println!("not logged in"),
        }
    }
}
