//! Userspace TCP/SOCKS gateway process.
//!
//! Receives a tunnel file descriptor from the host environment and bridges
//! it to an upstream SOCKS5 endpoint and DNS resolver. All flow state lives
//! in this process; the tunneled applications never touch a kernel socket.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use torvm::gateway::{DnsRelay, FdTun, Interceptor, SessionManager, SocksDialer};

#[derive(Parser, Debug)]
#[command(
    name = "torvm-gateway",
    version,
    about = "Userspace TCP/SOCKS gateway over a tunnel fd"
)]
struct Cli {
    /// Tunnel device file descriptor inherited from the host environment
    #[arg(long)]
    tun_fd: i32,

    /// Upstream SOCKS5 endpoint
    #[arg(long, default_value = "10.10.10.1:9050")]
    socks: SocketAddr,

    /// Upstream DNS resolver
    #[arg(long, default_value = "10.10.10.1:9093")]
    dns: SocketAddr,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    // SAFETY: the host environment hands us sole ownership of the fd.
    let tun = match unsafe { FdTun::from_raw_fd(cli.tun_fd) } {
        Ok(tun) => Arc::new(tun),
        Err(e) => {
            error!(fd = cli.tun_fd, "cannot adopt tunnel fd: {}", e);
            std::process::exit(1);
        }
    };

    let dialer = Arc::new(SocksDialer::new(cli.socks));
    let sessions = SessionManager::new(tun.clone(), dialer);
    let dns = DnsRelay::new(tun.clone(), cli.dns);
    let interceptor = Interceptor::new(tun, sessions.clone(), dns);

    info!(socks = %cli.socks, dns = %cli.dns, "gateway starting");

    let cancel = CancellationToken::new();
    let reaper = tokio::spawn(sessions.clone().run_reaper(cancel.clone()));

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        ctrl_c_cancel.cancel();
    });

    if let Err(e) = interceptor.run(cancel.clone()).await {
        error!("gateway failed: {:#}", e);
        cancel.cancel();
        let _ = reaper.await;
        std::process::exit(1);
    }

    cancel.cancel();
    let _ = reaper.await;
    info!("gateway exiting");
}
