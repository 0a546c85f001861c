use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::ctx::Context;

use wildland_fs::control::FsControl;
use wildland_fs::fs::WildlandFs;
use wildland_fs::mount_table::MountTable;

/// Wildland mount core: exposes mounted containers as one FUSE tree and
/// takes mount commands over a control socket.
#[derive(Debug, Parser)]
#[command(name = "wildland-fs", version)]
struct Args {
    /// Configuration base directory.
    #[arg(long, default_value = ".wildland")]
    base_dir: PathBuf,

    /// FUSE mountpoint (defaults to the configured mount-dir).
    #[arg(long)]
    mountpoint: Option<PathBuf>,

    /// Control socket path (defaults to the configured fs-socket-path).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Serve the control socket without mounting FUSE (tests, containers
    /// without /dev/fuse).
    #[arg(long)]
    no_fuse: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let ctx = Context::load(&args.base_dir)?;
    let mountpoint = args
        .mountpoint
        .clone()
        .unwrap_or_else(|| ctx.config.mount_dir());
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| ctx.config.fs_socket_path());

    let table = Arc::new(MountTable::new(ctx.clone()));
    let handler = Arc::new(FsControl::new(ctx.clone(), table.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let fuse_session = if args.no_fuse {
        None
    } else {
        std::fs::create_dir_all(&mountpoint)?;
        let fs = WildlandFs::new(runtime.handle().clone(), table.clone());
        let session = fuser::spawn_mount2(
            fs,
            &mountpoint,
            &[
                fuser::MountOption::FSName("wildland".to_string()),
                fuser::MountOption::DefaultPermissions,
            ],
        )?;
        tracing::info!("filesystem mounted at {}", mountpoint.display());
        Some(session)
    };

    runtime.block_on(async {
        let server = tokio::spawn({
            let socket = socket.clone();
            async move { common::control::serve(&socket, handler, shutdown_rx).await }
        });

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
        server.await??;
        Ok::<_, anyhow::Error>(())
    })?;

    if let Some(session) = fuse_session {
        session.join();
    }
    Ok(())
}
