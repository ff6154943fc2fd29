//! QEMU process management.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{args, qmp::QmpClient, statedisk, Hypervisor};
use crate::config::Config;
use crate::network::command::resolve_tool;
use crate::utils::spawn_streaming;

/// Manages one QEMU virtual machine process.
pub struct QemuInstance {
    config: Arc<Config>,
    /// Resolved and validated QEMU binary path. Resolution happens at
    /// construction so it is validated once; errors surface at start().
    qemu_path: Option<PathBuf>,
    started: AtomicBool,
    pid: Mutex<Option<u32>>,
    kill_tx: Mutex<Option<mpsc::Sender<()>>>,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl QemuInstance {
    pub fn new(config: Arc<Config>) -> Self {
        let qemu_path = match resolve_tool("qemu-system-x86_64") {
            Ok(path) => {
                info!(qemu = %path.display(), "resolved QEMU binary");
                Some(path)
            }
            Err(e) => {
                warn!("QEMU binary resolution failed: {:#}", e);
                None
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            config,
            qemu_path,
            started: AtomicBool::new(false),
            pid: Mutex::new(None),
            kill_tx: Mutex::new(None),
            exit_tx,
            exit_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Hypervisor for QemuInstance {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("vm: already running");
        }

        let Some(qemu_path) = self.qemu_path.clone() else {
            bail!("vm: QEMU binary not resolved; cannot start");
        };

        // Write the torrc overlay to the state disk when bridge or proxy
        // settings call for one.
        let overlay = self.config.torrc_overlay().context("vm: torrc overlay")?;
        if !overlay.is_empty() {
            statedisk::write_state_disk_file(
                &self.config.state_disk_path,
                "torrc.override",
                &overlay,
            )
            .await
            .context("vm: write torrc overlay")?;
            info!("wrote torrc overlay to state disk");
        }

        // Verify VM image files exist before launching.
        for (name, path) in [
            ("kernel", &self.config.kernel_path),
            ("initrd", &self.config.initrd_path),
            ("state disk", &self.config.state_disk_path),
        ] {
            if !std::path::Path::new(path).exists() {
                bail!("vm: {} file not found: {}", name, path);
            }
        }

        // The QMP socket lives in a directory only we can reach.
        if std::env::consts::OS != "windows" {
            if let Some(dir) = std::path::Path::new(&self.config.qmp_socket_path).parent() {
                std::fs::create_dir_all(dir).context("vm: create QMP socket dir")?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                        .context("vm: restrict QMP socket dir")?;
                }
            }
        }

        let argv = args::build_args(&self.config).context("vm: build args")?;
        info!(args = argv.len(), "starting QEMU");
        debug!(qemu = %qemu_path.display(), ?argv, "qemu command line");

        let mut cmd = tokio::process::Command::new(&qemu_path);
        cmd.args(&argv);
        let mut child = spawn_streaming(cmd, |line, is_stderr| {
            if is_stderr {
                warn!(target: "qemu", "{}", line);
            } else {
                debug!(target: "qemu", "{}", line);
            }
        })
        .context("vm: spawn qemu")?;

        *self.pid.lock().unwrap() = child.id();

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        *self.kill_tx.lock().unwrap() = Some(kill_tx);

        // Reap the child and publish its exit exactly once.
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        warn!("waiting for qemu: {}", e);
                        -1
                    }
                },
                _ = kill_rx.recv() => {
                    info!("killing QEMU process");
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(_) => -1,
                    }
                }
            };
            info!(code, "QEMU exited");
            let _ = exit_tx.send(Some(code));
        });

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.exit_rx.borrow().is_none()
    }

    async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        // The sender lives on self, so wait_for can only fail after drop;
        // report a signal-style exit in that case.
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        };
        result
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        match QmpClient::connect(&self.config.qmp_socket_path).await {
            Ok(mut qmp) => {
                info!("sending QMP system_powerdown");
                match qmp.system_powerdown().await {
                    Ok(()) => {
                        if tokio::time::timeout(timeout, self.wait_exit()).await.is_ok() {
                            return Ok(());
                        }
                        warn!("graceful shutdown timed out after {:?}", timeout);
                    }
                    Err(e) => warn!("QMP powerdown failed: {}", e),
                }
            }
            Err(e) => warn!("QMP connect failed: {}", e),
        }

        self.kill().await
    }

    async fn kill(&self) -> Result<()> {
        let tx = self.kill_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
            self.wait_exit().await;
        }
        Ok(())
    }
}

impl Drop for QemuInstance {
    fn drop(&mut self) {
        // Remove the QMP socket left behind by an unclean exit.
        if std::env::consts::OS != "windows" {
            let path = std::path::Path::new(&self.config.qmp_socket_path);
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
