use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use lazyfs_blob_server::{http_server, Store};

#[derive(Parser, Debug)]
#[command(name = "lazyfs-blob-server")]
#[command(about = "Content-addressed blob server for lazyfs workers")]
struct Args {
    /// Directory holding the hash-named blob files
    #[arg(long, default_value = "blobstore")]
    data_dir: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    /// Default log level (overridable via RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_level);

    let store = match Store::open(&args.data_dir).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(dir = %args.data_dir.display(), %err, "failed to open blob store");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => tracing::debug!("shutting down on SIGINT"),
            _ = sigterm.recv() => tracing::debug!("shutting down on SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    });

    if let Err(err) = http_server::run(args.listen, store, shutdown_rx).await {
        tracing::error!(%err, "blob server exited with error");
        std::process::exit(1);
    }
}

fn init_logging(level: tracing::Level) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stdout_layer).init();
}
