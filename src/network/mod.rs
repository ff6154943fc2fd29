pub mod command;
pub mod darwin;
pub mod linux;
pub mod windows;

pub use darwin::DarwinAdapter;
pub use linux::LinuxAdapter;
pub use windows::WindowsAdapter;

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{bail, Result};

/// Opaque platform-specific network state captured by `save_config` and
/// consumed only by `restore_config` of the same adapter.
#[derive(Debug, Clone)]
pub struct SavedConfig {
    pub platform: &'static str,
    pub data: Vec<u8>,
    /// Session-local integrity tag over `data`; only the Windows adapter
    /// produces and checks one, because only it executes the blob.
    pub hmac: Option<String>,
}

/// Platform-specific network configuration operations.
///
/// All host routing and DNS mutation funnels through this trait; the
/// lifecycle engine is the only caller and drives it from a single task.
#[async_trait::async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Create and address a TAP adapter.
    async fn create_tap(
        &self,
        name: &str,
        host_ip: Ipv4Addr,
        vm_ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<()>;

    /// Remove a TAP adapter.
    async fn destroy_tap(&self, name: &str) -> Result<()>;

    /// Capture the current network configuration for later restore.
    async fn save_config(&self) -> Result<SavedConfig>;

    /// Restore a previously saved network configuration.
    async fn restore_config(&self, saved: &SavedConfig) -> Result<()>;

    /// Install the diversion so traffic flows through the VM.
    async fn setup_routing(&self, tap_name: &str, vm_ip: Ipv4Addr) -> Result<()>;

    /// Remove the routes added by `setup_routing`.
    async fn teardown_routing(&self) -> Result<()>;

    /// Clear the system DNS cache.
    async fn flush_dns(&self) -> Result<()>;
}

/// Construct the adapter for the running operating system.
pub fn adapter_for_host() -> Result<Arc<dyn NetworkAdapter>> {
    match std::env::consts::OS {
        "linux" => Ok(Arc::new(LinuxAdapter::new())),
        "macos" => Ok(Arc::new(DarwinAdapter::new())),
        "windows" => Ok(Arc::new(WindowsAdapter::new())),
        other => bail!("unsupported platform: {}", other),
    }
}

/// Number of leading ones in a dotted-quad netmask, for `ip addr add` CIDR
/// notation.
pub(crate) fn mask_prefix_len(mask: Ipv4Addr) -> u32 {
    u32::from(mask).count_ones()
}
