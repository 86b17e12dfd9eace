//! Process-level plumbing: logging, panic reporting, signal-driven
//! shutdown, and stale-mount recovery.

use std::path::Path;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub fn init_logging(level: tracing::Level) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stdout_layer).init();
}

/// Route panics through `tracing` so they land in the same stream as
/// everything else.
pub fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(loc) => {
            tracing::error!(
                message = %panic,
                panic.file = loc.file(),
                panic.line = loc.line(),
                panic.column = loc.column(),
            );
        }
        None => tracing::error!(message = %panic),
    }));
}

/// Spawn a task that waits for SIGINT/SIGTERM and then signals
/// shutdown through a watch channel.
pub fn graceful_shutdown_blocker() -> (JoinHandle<()>, watch::Receiver<()>) {
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    let (tx, rx) = watch::channel(());
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::debug!("shutting down on SIGINT"),
            _ = sigterm.recv() => tracing::debug!("shutting down on SIGTERM"),
        }
        let _ = tx.send(());
    });

    (handle, rx)
}

/// Best-effort unmount of a possibly stale previous mount. A failed
/// unmount is normal when nothing is mounted there.
pub fn unmount_stale(mountpoint: &Path) {
    let fusermount = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mountpoint)
        .status();
    match fusermount {
        Ok(status) if status.success() => {
            tracing::info!(path = %mountpoint.display(), "unmounted stale mount");
            return;
        }
        _ => {}
    }

    if let Err(err) = std::process::Command::new("umount")
        .arg(mountpoint)
        .status()
    {
        tracing::debug!(path = %mountpoint.display(), %err, "umount fallback unavailable");
    }
}
