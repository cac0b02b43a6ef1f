use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod error;
mod events;
mod exec;
mod observer;
mod pty;
mod server;
mod topology;

use server::AppState;
use topology::Topology;

#[derive(Parser, Debug)]
#[command(
    name = "netlab",
    author,
    version,
    disable_version_flag = true,
    about = "Kernel-level network emulator server"
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    /// Address for the control and streaming server
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Deadline for control operations, in seconds
    #[arg(long = "op-timeout-secs", default_value = "10")]
    op_timeout_secs: u64,

    /// How long a detached terminal session is retained for reconnects,
    /// in seconds
    #[arg(long = "grace-secs", default_value = "30")]
    grace_secs: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Cli::parse();
    if args.print_version {
        println!(
            "{} {} (rev {}, {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("NETLAB_GIT_REV"),
            env!("NETLAB_BUILD_PROFILE")
        );
        return Ok(());
    }

    // Namespace administration needs root; better one clear diagnostic at
    // startup than a Privilege error on every operation.
    if !nix::unistd::Uid::effective().is_root() {
        bail!("netlab must run as root (network namespace administration)");
    }
    if let Err(defect) = netkit::verify_host() {
        bail!("host cannot run the emulator: {defect}");
    }

    let (events_tx, events_rx) = events::channel();
    tokio::spawn(events::run_listener(events_rx));

    let topology = Topology::new(events_tx, Duration::from_secs(args.grace_secs));

    let state = AppState {
        topology: topology.clone(),
        op_timeout: Duration::from_secs(args.op_timeout_secs),
        started: Instant::now(),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;

    let result = server::serve(listener, state, shutdown.clone()).await;

    // Cleanup runs on every exit path so no namespaces or veth pairs
    // outlive the server.
    teardown(&topology).await;

    result.context("control server failed")
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
    Ok(())
}

async fn teardown(topology: &Arc<Topology>) {
    info!("shutting down; cleaning up kernel state");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(60), topology.cleanup()).await {
        error!("teardown did not finish in time: {e}");
    }
}
