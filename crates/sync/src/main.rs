use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::ctx::Context;

use wildland_sync::daemon::SyncDaemon;

/// Wildland sync daemon: keeps pairs of storage backends converged and
/// takes job commands over a control socket.
#[derive(Debug, Parser)]
#[command(name = "wildland-sync", version)]
struct Args {
    /// Configuration base directory.
    #[arg(long, default_value = ".wildland")]
    base_dir: PathBuf,

    /// Control socket path (defaults to the configured sync-socket-path).
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let ctx = Context::load(&args.base_dir)?;
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| ctx.config.sync_socket_path());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let daemon = Arc::new(SyncDaemon::new(ctx, shutdown_tx.clone()));

    let server = tokio::spawn({
        let socket = socket.clone();
        let daemon = daemon.clone();
        async move { common::control::serve(&socket, daemon, shutdown_rx).await }
    });

    let mut shutdown_watch = shutdown_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            daemon.stop_all();
            let _ = shutdown_tx.send(true);
        }
        // the `shutdown` control command flips the flag itself
        _ = shutdown_watch.changed() => {}
    }

    server.await??;
    Ok(())
}
