//! netsecfs CLI.
//!
//! Usage:
//!   netsecfs init --storage <path> --meta <path> <name>
//!   netsecfs --meta <path> <mountpoint>

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use netsecfs::format::{valid_volume_name, Format};
use netsecfs::meta::MetaStore;
use netsecfs::object::ObjectStore;
use netsecfs::repl::Console;

#[derive(Parser)]
#[command(
    name = "netsecfs",
    version,
    about = "Mount a FUSE filesystem that encrypts names and contents at rest",
    long_about = "Mount a FUSE filesystem that encrypts and decrypts files based on a password.\n\
                  Initialize the databases with `netsecfs init` before mounting."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the metadata database.
    #[arg(short, long)]
    meta: Option<PathBuf>,

    /// Directory to serve the interactive mount session on.
    mountpoint: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the filesystem by creating both databases.
    Init {
        /// Path to the object (storage) database.
        #[arg(short, long)]
        storage: PathBuf,

        /// Path to the metadata database.
        #[arg(short, long)]
        meta: PathBuf,

        /// Volume name.
        name: String,
    },
}

fn die(msg: &str) -> ! {
    eprintln!("error: {}", msg);
    process::exit(1);
}

fn init(storage: &PathBuf, meta_path: &PathBuf, name: &str) {
    if !valid_volume_name(name) {
        die(&format!(
            "invalid name {:?}: lowercase alphanumerics and dashes only, 3 to 63 characters",
            name
        ));
    }
    // Creating the object store also creates its schema and the file.
    if let Err(e) = ObjectStore::open(&storage.to_string_lossy()) {
        die(&format!("open object database: {}", e));
    }
    // The format record carries the absolute path so mounts resolve it
    // from any working directory.
    let storage = match storage.canonicalize() {
        Ok(p) => p,
        Err(e) => die(&format!("resolve storage path: {}", e)),
    };
    let storage_str = storage.to_string_lossy().into_owned();

    let meta = match MetaStore::open(&meta_path.to_string_lossy()) {
        Ok(meta) => meta,
        Err(e) => die(&format!("open meta database: {}", e)),
    };
    let mut format = Format::new(name, &storage_str);
    if let Err(e) = meta.init(&mut format) {
        die(&format!("init: {}", e));
    }
    info!(name, uuid = %format.uuid, "volume formatted");
    println!("volume {} formatted (uuid {})", format.name, format.uuid);
}

fn serve(meta_path: &PathBuf, mountpoint: PathBuf) {
    let meta = match MetaStore::open(&meta_path.to_string_lossy()) {
        Ok(meta) => Arc::new(meta),
        Err(e) => die(&format!("open meta database: {}", e)),
    };
    let format = match meta.load_format() {
        Ok(format) => format,
        Err(e) => die(&e.to_string()),
    };
    if !mountpoint.is_dir() {
        die(&format!("{} is not a directory", mountpoint.display()));
    }
    println!("volume {} — `help` for commands", format.name);
    Console::new(meta, format, mountpoint).run();
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("NSFS_LOG")
        .unwrap_or_else(|_| "netsecfs=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Init { storage, meta, name }) => init(&storage, &meta, &name),
        None => {
            let meta = cli
                .meta
                .unwrap_or_else(|| die("--meta is required to mount"));
            let mountpoint = cli
                .mountpoint
                .unwrap_or_else(|| die("a mountpoint argument is required"));
            serve(&meta, mountpoint);
        }
    }
}
