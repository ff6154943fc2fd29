use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use torvm::cli::Cli;
use torvm::lifecycle::Engine;
use torvm::vm::QemuInstance;
use torvm::{logging, network, platform, Config};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: load config: {:#}", e);
            std::process::exit(1);
        }
    };
    config.verbose |= cli.verbose;
    config.headless |= cli.headless;

    // The ring keeps the most recent log lines for status surfaces; it must
    // outlive the lifecycle so late teardown messages land in it too.
    let _ring = logging::init(config.verbose);

    // Detect platform capabilities; an explicit --accel only overrides the
    // backend choice, never the capability probes.
    let detected = platform::detect().await;
    config.vhost_net = detected.vhost_net;
    config.iommu_enabled = detected.iommu;
    if let Some(accel) = cli.accel.as_deref() {
        match platform::Accel::parse(accel) {
            Ok(accel) => config.accel = accel.as_str().to_string(),
            Err(e) => {
                error!("{:#}", e);
                std::process::exit(1);
            }
        }
    } else if config.accel.is_empty() {
        config.accel = detected.accel.as_str().to_string();
    }

    info!(accel = %config.accel, "torvm controller starting");

    if cli.clean || cli.replace {
        info!(disk = %config.state_disk_path, "removing state disk");
        let _ = std::fs::remove_file(&config.state_disk_path);
    }

    let network = match network::adapter_for_host() {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let config = Arc::new(config);
    let vm = Arc::new(QemuInstance::new(config.clone()));
    let mut engine = Engine::new(config, network, vm);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Err(e) = engine.run(cancel).await {
        error!("lifecycle error: {:#}", e);
        std::process::exit(1);
    }

    info!("torvm controller exiting");
}

/// Cancel the lifecycle on SIGINT or SIGTERM; the engine then runs its
/// cleanup states before the process exits.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term =
                signal(SignalKind::terminate()).expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("received shutdown signal");
        cancel.cancel();
    });
}
