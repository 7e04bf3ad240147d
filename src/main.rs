//! Mount a Perforce depot as a filesystem, one directory per changelist.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use p4fs::cache::BackingStore;
use p4fs::fs::{FuserAdapter, P4Fs};
use p4fs::p4::{Conn, ConnOptions};

#[derive(Parser)]
#[command(
    version,
    about = "Mount a Perforce depot as a read-only filesystem.",
    arg_required_else_help = true
)]
struct Args {
    /// Switch on filesystem request debugging.
    #[arg(long)]
    fs_debug: bool,

    /// Address for the P4 server, passed to the client as -p.
    #[arg(long, default_value = "")]
    p4_server: String,

    /// Binary for the P4 command-line client.
    #[arg(long, default_value = "p4")]
    p4_binary: String,

    /// Directory to store file contents. A temporary directory, removed at
    /// exit, is used when omitted.
    #[arg(long)]
    backing: Option<PathBuf>,

    /// Record a CPU profile (flamegraph) to this file.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Where to mount the filesystem.
    mount_point: PathBuf,
}

fn init_tracing(fs_debug: bool) {
    let default = if fs_debug { "p4fs=debug" } else { "p4fs=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn main() {
    let args = Args::parse();
    init_tracing(args.fs_debug);
    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), std::io::Error> {
    let profiler = match &args.profile {
        Some(_) => Some(pprof::ProfilerGuard::new(100).map_err(std::io::Error::other)?),
        None => None,
    };

    // The guard keeps a default backing directory alive for the whole
    // mount; dropping it at the end of run() removes the directory.
    let (backing_root, _tmp_guard) = match &args.backing {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            (dir.clone(), None)
        }
        None => {
            let tmp = tempfile::Builder::new().prefix("p4fs").tempdir()?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };

    let conn = Conn::new(ConnOptions {
        binary: args.p4_binary.clone(),
        address: args.p4_server.clone(),
    });
    let fs = P4Fs::new(conn, BackingStore::new(&backing_root));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let owner = (
        nix::unistd::Uid::current().as_raw(),
        nix::unistd::Gid::current().as_raw(),
    );
    let adapter = FuserAdapter::new(fs.root(), owner, runtime.handle().clone());

    let options = [
        fuser::MountOption::FSName("p4fs".to_owned()),
        fuser::MountOption::RO,
        fuser::MountOption::NoDev,
        fuser::MountOption::NoSuid,
        fuser::MountOption::AutoUnmount,
    ];
    info!(
        mount_point = %args.mount_point.display(),
        backing = %backing_root.display(),
        "mounting"
    );
    let session = fuser::spawn_mount2(adapter, &args.mount_point, &options)?;

    runtime.block_on(wait_for_exit())?;
    info!("unmounting");
    drop(session);

    if let (Some(path), Some(profiler)) = (&args.profile, profiler) {
        write_profile(path, &profiler)?;
    }
    Ok(())
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = sigterm.recv() => info!("terminated, shutting down"),
    }
    Ok(())
}

fn write_profile(path: &Path, profiler: &pprof::ProfilerGuard<'_>) -> Result<(), std::io::Error> {
    let report = profiler.report().build().map_err(std::io::Error::other)?;
    let file = std::fs::File::create(path)?;
    report.flamegraph(file).map_err(std::io::Error::other)?;
    info!(profile = %path.display(), "wrote CPU profile");
    Ok(())
}
