pub mod failsafe;

pub use failsafe::FailSafe;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::network::{NetworkAdapter, SavedConfig};
use crate::vm::Hypervisor;

/// A lifecycle phase. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Init,
    CheckPrivileges,
    SaveNetwork,
    CreateTap,
    LaunchVm,
    WaitTap,
    ConfigureTap,
    FlushDns,
    WaitBootstrap,
    Running,
    Shutdown,
    RestoreNetwork,
    Cleanup,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "Init",
            LifecycleState::CheckPrivileges => "CheckPrivileges",
            LifecycleState::SaveNetwork => "SaveNetwork",
            LifecycleState::CreateTap => "CreateTAP",
            LifecycleState::LaunchVm => "LaunchVM",
            LifecycleState::WaitTap => "WaitTAP",
            LifecycleState::ConfigureTap => "ConfigureTAP",
            LifecycleState::FlushDns => "FlushDNS",
            LifecycleState::WaitBootstrap => "WaitBootstrap",
            LifecycleState::Running => "Running",
            LifecycleState::Shutdown => "Shutdown",
            LifecycleState::RestoreNetwork => "RestoreNetwork",
            LifecycleState::Cleanup => "Cleanup",
            LifecycleState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the lifecycle after cleanup has completed.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("config validation: {0}")]
    ConfigValidation(#[source] anyhow::Error),
    #[error("privilege or system error: {0}")]
    PrivilegeOrSystem(#[source] anyhow::Error),
    #[error("network setup: {0}")]
    NetworkSetup(#[source] anyhow::Error),
    #[error("hypervisor launch: {0}")]
    HypervisorLaunch(#[source] anyhow::Error),
    #[error("VM unreachable: {0}")]
    VmUnreachable(String),
    #[error("bootstrap timeout after {0:?}")]
    BootstrapTimeout(Duration),
    #[error("VM exited unexpectedly (code {0})")]
    VmExited(i32),
    #[error("lifecycle entered failed state")]
    Failed,
}

/// Callback invoked synchronously for every state transition.
pub type StateObserver = Box<dyn Fn(LifecycleState, LifecycleState) + Send + Sync>;

/// Engine pacing. The defaults are production values; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    /// Total wait for the VM gateway's management port.
    pub tap_wait: Duration,
    pub tap_interval: Duration,
    /// Total wait for the advertised local proxy port.
    pub bootstrap_wait: Duration,
    pub bootstrap_interval: Duration,
    /// Per-attempt TCP connect bound.
    pub probe: Duration,
    /// Graceful powerdown bound before the forced kill.
    pub shutdown: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            tap_wait: Duration::from_secs(60),
            tap_interval: Duration::from_secs(1),
            bootstrap_wait: Duration::from_secs(300),
            bootstrap_interval: Duration::from_secs(2),
            probe: Duration::from_secs(2),
            shutdown: Duration::from_secs(10),
        }
    }
}

/// Drives the VM lifecycle state machine.
pub struct Engine {
    config: Arc<Config>,
    network: Arc<dyn NetworkAdapter>,
    vm: Arc<dyn Hypervisor>,
    failsafe: FailSafe,
    timeouts: EngineTimeouts,
    require_root: bool,

    state: LifecycleState,
    saved: Option<SavedConfig>,
    observers: Vec<StateObserver>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        network: Arc<dyn NetworkAdapter>,
        vm: Arc<dyn Hypervisor>,
    ) -> Self {
        Self {
            config,
            network: network.clone(),
            vm,
            failsafe: FailSafe::new(network),
            timeouts: EngineTimeouts::default(),
            require_root: true,
            state: LifecycleState::Init,
            saved: None,
            observers: Vec::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Skip the root check; host environments that grant the needed
    /// capabilities some other way (and tests) use this.
    pub fn without_privilege_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    /// Register a callback for state transitions.
    pub fn on_state_change<F>(&mut self, f: F)
    where
        F: Fn(LifecycleState, LifecycleState) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(f));
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn failsafe(&self) -> &FailSafe {
        &self.failsafe
    }

    /// Progress through the lifecycle states until Cleanup completes or the
    /// engine refuses to start. Blocks until the VM exits or `cancel` fires
    /// and cleanup has run. The first non-recovered error is returned after
    /// cleanup.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), LifecycleError> {
        let mut first_err: Option<LifecycleError> = None;

        loop {
            if cancel.is_cancelled() && self.state < LifecycleState::Shutdown {
                self.transition(LifecycleState::Shutdown);
            }

            info!(state = %self.state, "lifecycle: entering state");

            let step = match self.state {
                LifecycleState::Init => {
                    self.transition(LifecycleState::CheckPrivileges);
                    Ok(())
                }

                LifecycleState::CheckPrivileges => {
                    if let Err(e) = self.check_privileges() {
                        // Nothing has been touched yet; refuse to start.
                        self.transition(LifecycleState::Failed);
                        return Err(e);
                    }
                    self.transition(LifecycleState::SaveNetwork);
                    Ok(())
                }

                LifecycleState::SaveNetwork => self.do_save_network().await,
                LifecycleState::CreateTap => self.do_create_tap().await,
                LifecycleState::LaunchVm => self.do_launch_vm().await,
                LifecycleState::WaitTap => self.do_wait_tap(&cancel).await,
                LifecycleState::ConfigureTap => self.do_configure_tap().await,
                LifecycleState::FlushDns => self.do_flush_dns().await,
                LifecycleState::WaitBootstrap => self.do_wait_bootstrap(&cancel).await,
                LifecycleState::Running => self.do_running(&cancel, &mut first_err).await,
                LifecycleState::Shutdown => self.do_shutdown().await,
                LifecycleState::RestoreNetwork => self.do_restore_network().await,

                LifecycleState::Cleanup => {
                    self.failsafe.deactivate().await;
                    info!("lifecycle: cleanup complete");
                    return match first_err {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }

                LifecycleState::Failed => {
                    return Err(first_err.unwrap_or(LifecycleError::Failed));
                }
            };

            if let Err(e) = step {
                error!(state = %self.state, "lifecycle: step failed: {}", e);
                self.failsafe.activate().await;
                if first_err.is_none() {
                    first_err = Some(e);
                }
                self.transition(LifecycleState::Shutdown);
            }
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        let prev = self.state;
        debug!(from = %prev, to = %next, "lifecycle transition");
        self.state = next;
        for observer in &self.observers {
            observer(prev, next);
        }
    }

    fn check_privileges(&self) -> Result<(), LifecycleError> {
        if !self.require_root {
            return Ok(());
        }
        if std::env::consts::OS == "windows" {
            // Privileges are checked by the OS when the TAP adapter is
            // configured.
            return Ok(());
        }
        #[cfg(unix)]
        {
            let uid = nix::unistd::geteuid();
            if !uid.is_root() {
                return Err(LifecycleError::PrivilegeOrSystem(anyhow::anyhow!(
                    "must run as root (current uid={})",
                    uid
                )));
            }
        }
        Ok(())
    }

    async fn do_save_network(&mut self) -> Result<(), LifecycleError> {
        let saved = self
            .network
            .save_config()
            .await
            .map_err(LifecycleError::PrivilegeOrSystem)?;
        self.saved = Some(saved);
        self.transition(LifecycleState::CreateTap);
        Ok(())
    }

    async fn do_create_tap(&mut self) -> Result<(), LifecycleError> {
        let (host_ip, vm_ip, mask) = self.parse_addrs()?;
        self.network
            .create_tap(&self.config.tap_name, host_ip, vm_ip, mask)
            .await
            .map_err(LifecycleError::NetworkSetup)?;
        self.transition(LifecycleState::LaunchVm);
        Ok(())
    }

    async fn do_launch_vm(&mut self) -> Result<(), LifecycleError> {
        self.vm
            .start()
            .await
            .map_err(LifecycleError::HypervisorLaunch)?;
        self.transition(LifecycleState::WaitTap);
        Ok(())
    }

    async fn do_wait_tap(&mut self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let port = self.config.control_port;
        match self
            .poll_port(cancel, port, self.timeouts.tap_wait, self.timeouts.tap_interval)
            .await?
        {
            PollOutcome::Reachable => {
                self.transition(LifecycleState::ConfigureTap);
                Ok(())
            }
            PollOutcome::Cancelled => Ok(()),
            PollOutcome::TimedOut => Err(LifecycleError::VmUnreachable(format!(
                "management port {} not reachable after {:?}",
                port, self.timeouts.tap_wait
            ))),
        }
    }

    async fn do_configure_tap(&mut self) -> Result<(), LifecycleError> {
        let (_, vm_ip, _) = self.parse_addrs()?;
        self.network
            .setup_routing(&self.config.tap_name, vm_ip)
            .await
            .map_err(LifecycleError::NetworkSetup)?;
        self.transition(LifecycleState::FlushDns);
        Ok(())
    }

    async fn do_flush_dns(&mut self) -> Result<(), LifecycleError> {
        if let Err(e) = self.network.flush_dns().await {
            error!("flush DNS failed (non-fatal): {:#}", e);
        }
        self.transition(LifecycleState::WaitBootstrap);
        Ok(())
    }

    async fn do_wait_bootstrap(&mut self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let port = self.config.socks_port;
        match self
            .poll_port(
                cancel,
                port,
                self.timeouts.bootstrap_wait,
                self.timeouts.bootstrap_interval,
            )
            .await?
        {
            PollOutcome::Reachable => {
                info!("SOCKS port is reachable, bootstrap likely complete");
                self.transition(LifecycleState::Running);
                Ok(())
            }
            PollOutcome::Cancelled => Ok(()),
            PollOutcome::TimedOut => {
                Err(LifecycleError::BootstrapTimeout(self.timeouts.bootstrap_wait))
            }
        }
    }

    async fn do_running(
        &mut self,
        cancel: &CancellationToken,
        first_err: &mut Option<LifecycleError>,
    ) -> Result<(), LifecycleError> {
        info!("VM is running, traffic diverted");
        self.failsafe.deactivate().await;

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancellation received, shutting down");
            }
            code = self.vm.wait_exit() => {
                error!(code, "VM exited unexpectedly");
                self.failsafe.activate().await;
                if first_err.is_none() {
                    *first_err = Some(LifecycleError::VmExited(code));
                }
            }
        }

        self.transition(LifecycleState::Shutdown);
        Ok(())
    }

    async fn do_shutdown(&mut self) -> Result<(), LifecycleError> {
        if self.vm.is_running() {
            if let Err(e) = self.vm.stop(self.timeouts.shutdown).await {
                error!("VM stop error: {:#}", e);
            }
        }
        self.transition(LifecycleState::RestoreNetwork);
        Ok(())
    }

    async fn do_restore_network(&mut self) -> Result<(), LifecycleError> {
        // All three steps run regardless of earlier failures.
        if let Err(e) = self.network.teardown_routing().await {
            error!("teardown routing failed: {:#}", e);
        }

        if let Some(saved) = self.saved.take() {
            if let Err(e) = self.network.restore_config(&saved).await {
                error!("restore network failed: {:#}", e);
            }
        }

        if let Err(e) = self.network.destroy_tap(&self.config.tap_name).await {
            error!("destroy tap failed: {:#}", e);
        }

        self.transition(LifecycleState::Cleanup);
        Ok(())
    }

    /// Probe `vm_ip:port` until it accepts a TCP connection, the deadline
    /// passes, the VM exits, or the token fires.
    async fn poll_port(
        &self,
        cancel: &CancellationToken,
        port: u16,
        total: Duration,
        interval: Duration,
    ) -> Result<PollOutcome, LifecycleError> {
        let (_, vm_ip, _) = self.parse_addrs()?;
        let deadline = Instant::now() + total;

        loop {
            if cancel.is_cancelled() {
                return Ok(PollOutcome::Cancelled);
            }
            if !self.vm.is_running() {
                let code = self.vm.wait_exit().await;
                return Err(LifecycleError::VmExited(code));
            }

            if let Ok(Ok(_)) = tokio::time::timeout(
                self.timeouts.probe,
                TcpStream::connect((vm_ip, port)),
            )
            .await
            {
                return Ok(PollOutcome::Reachable);
            }

            if Instant::now() >= deadline {
                return Ok(PollOutcome::TimedOut);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            }
        }
    }

    fn parse_addrs(&self) -> Result<(Ipv4Addr, Ipv4Addr, Ipv4Addr), LifecycleError> {
        let parse = |name: &str, val: &str| -> Result<Ipv4Addr, LifecycleError> {
            val.parse().map_err(|_| {
                LifecycleError::NetworkSetup(anyhow::anyhow!("invalid {}: {:?}", name, val))
            })
        };
        Ok((
            parse("host_ip", &self.config.host_ip)?,
            parse("vm_ip", &self.config.vm_ip)?,
            parse("subnet_mask", &self.config.subnet_mask)?,
        ))
    }
}

enum PollOutcome {
    Reachable,
    Cancelled,
    TimedOut,
}
