use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use url::Url;

use lazyfs_worker::client::BlobClient;
use lazyfs_worker::database::Database;
use lazyfs_worker::fuse::{FsCore, WorkerFs};
use lazyfs_worker::http_server::{self, AppState};
use lazyfs_worker::process;

#[derive(Parser, Debug)]
#[command(name = "lazyfs-worker")]
#[command(about = "Mount a lazy content-addressed rootfs and serve container runs")]
struct Args {
    /// Where to mount the filesystem
    mountpoint: PathBuf,

    /// Base URL of the blob server
    #[arg(long, default_value = "http://localhost:8443")]
    server: Url,

    /// Local blob cache directory
    #[arg(long, default_value = "filecache")]
    cache_dir: PathBuf,

    /// Run-log sqlite database
    #[arg(long, default_value = "runs.db")]
    db_path: PathBuf,

    /// Port for the control-plane HTTP server
    #[arg(long, default_value_t = 8444)]
    http_port: u16,

    /// Default log level (overridable via RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    process::init_logging(args.log_level);
    process::register_panic_logger();

    // Recover from a crashed previous worker that left the mount
    // behind.
    process::unmount_stale(&args.mountpoint);

    if let Err(err) = std::fs::create_dir_all(&args.cache_dir) {
        tracing::error!(dir = %args.cache_dir.display(), %err, "failed to create cache directory");
        std::process::exit(1);
    }

    let db = match Database::connect(&format!("sqlite:{}", args.db_path.display())).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(%err, "failed to open run-log database");
            std::process::exit(1);
        }
    };

    let client = match BlobClient::new(args.server.clone()) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(%err, "failed to build blob client");
            std::process::exit(1);
        }
    };

    let mountpoint = match std::fs::canonicalize(&args.mountpoint) {
        Ok(path) => path,
        Err(err) => {
            tracing::error!(path = %args.mountpoint.display(), %err, "mountpoint does not exist");
            std::process::exit(1);
        }
    };

    let core = Arc::new(FsCore::new(
        client,
        args.cache_dir.clone(),
        tokio::runtime::Handle::current(),
    ));

    let options = vec![
        MountOption::FSName("lazyfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::AllowOther,
    ];
    let session = match fuser::spawn_mount2(WorkerFs::new(core.clone()), &mountpoint, &options) {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(path = %mountpoint.display(), %err, "mount failed");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %mountpoint.display(), server = %args.server, "filesystem mounted");

    let state = AppState::new(core, db, mountpoint.join("app"));
    let (_signal_task, shutdown_rx) = process::graceful_shutdown_blocker();
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));

    if let Err(err) = http_server::run_server(listen_addr, state, shutdown_rx).await {
        tracing::error!(%err, "control plane exited with error");
    }

    drop(session);
    tracing::info!("unmounted");
}
