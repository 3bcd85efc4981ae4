use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use fuser::MountOption;
use oxfs_core::{FileTable, MasterKey, OsStorage, RepoConfig, RepoLocker, init_repository};
use oxfs_fuse::{FuseHighLevelOps, MountConfig, OwnerOverride, OxFs};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "oxfs")]
#[command(author, version, about = "Encrypted overlay filesystem")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new repository
    Init(InitArgs),

    /// Mount a repository
    Mount(MountArgs),
}

#[derive(Args)]
struct InitArgs {
    /// Directory holding the encrypted repository (created if missing)
    repo: PathBuf,

    /// Hex key file; a new key is generated and written here if it does not exist
    #[arg(long, env = "OXFS_KEY_FILE")]
    key_file: PathBuf,
}

#[derive(Args)]
struct MountArgs {
    /// Directory holding the encrypted repository
    repo: PathBuf,

    /// Where to mount the plaintext view
    mountpoint: PathBuf,

    /// Hex key file
    #[arg(long, env = "OXFS_KEY_FILE")]
    key_file: PathBuf,

    /// Mount read-only (no repository lock is taken)
    #[arg(long)]
    read_only: bool,

    /// Match names case-insensitively
    #[arg(long)]
    case_insensitive: bool,

    /// Report this uid as the owner of every file
    #[arg(long)]
    uid: Option<u32>,

    /// Report this gid as the group of every file
    #[arg(long)]
    gid: Option<u32>,

    /// Report default permissions instead of the stored ones
    #[arg(long)]
    hide_permissions: bool,

    /// Attribute cache TTL in seconds
    #[arg(long, default_value_t = 1)]
    attr_ttl: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match cli.command {
        Commands::Init(args) => run_init(&args),
        Commands::Mount(args) => run_mount(&args),
    }
}

fn run_init(args: &InitArgs) -> Result<()> {
    let key = if args.key_file.exists() {
        MasterKey::read_key_file(&args.key_file)
            .with_context(|| format!("Failed to read key file {}", args.key_file.display()))?
    } else {
        let key = MasterKey::generate();
        key.write_key_file(&args.key_file)
            .with_context(|| format!("Failed to write key file {}", args.key_file.display()))?;
        eprintln!("Generated new key at {}", args.key_file.display());
        key
    };

    let storage = OsStorage::new(&args.repo);
    init_repository(&storage, &key)
        .with_context(|| format!("Failed to initialize {}", args.repo.display()))?;
    eprintln!("Initialized repository at {}", args.repo.display());
    Ok(())
}

fn run_mount(args: &MountArgs) -> Result<()> {
    if !args.mountpoint.is_dir() {
        bail!("Mountpoint {} is not a directory", args.mountpoint.display());
    }

    let key = MasterKey::read_key_file(&args.key_file)
        .with_context(|| format!("Failed to read key file {}", args.key_file.display()))?;
    let storage = OsStorage::new(&args.repo);
    let config = RepoConfig::load(&storage)
        .with_context(|| format!("{} is not an oxfs repository", args.repo.display()))?;
    config.verify_key(&key).context("Key does not match repository")?;

    let mut locker =
        RepoLocker::acquire(&storage, args.read_only).context("Failed to lock repository")?;

    let table = if args.read_only {
        FileTable::new_read_only(storage, key)
    } else {
        FileTable::new(storage, key)
    };
    let mount_config = MountConfig::default()
        .read_only(args.read_only)
        .case_insensitive(args.case_insensitive)
        .owner_override(OwnerOverride {
            uid: args.uid,
            gid: args.gid,
            hide_permissions: args.hide_permissions,
        })
        .attr_ttl(Duration::from_secs(args.attr_ttl));
    let ops = Arc::new(FuseHighLevelOps::new(Arc::new(table), mount_config));

    let mut options = vec![
        MountOption::FSName(format!("oxfs:{}", args.repo.display())),
        MountOption::Subtype("oxfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    if args.read_only {
        options.push(MountOption::RO);
    }

    let session = match fuser::spawn_mount2(OxFs::new(Arc::clone(&ops)), &args.mountpoint, &options)
    {
        Ok(session) => session,
        Err(e) => {
            ops.shutdown();
            return Err(e)
                .with_context(|| format!("Failed to mount at {}", args.mountpoint.display()));
        }
    };
    info!(mountpoint = %args.mountpoint.display(), "Mounted");
    eprintln!("Press Ctrl+C to unmount and exit");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, unmounting...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    // Joining unmounts and runs `destroy`; the explicit shutdown covers a
    // session that ended before `init` completed.
    session.join();
    ops.shutdown();
    locker.release();
    eprintln!("Unmounted successfully");
    Ok(())
}
