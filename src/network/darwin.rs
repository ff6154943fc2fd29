//! macOS network adapter.
//!
//! QEMU's vmnet-shared backend owns the interface, so TAP create/destroy
//! are no-ops here. Full traffic coverage is achieved with two half-default
//! routes (0.0.0.0/1 and 128.0.0.0/1): they are more specific than the
//! existing default route, which must survive so vmnet's shared network can
//! still reach the Internet.

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use super::command::{run, run_capture};
use super::{NetworkAdapter, SavedConfig};

pub struct DarwinAdapter;

impl DarwinAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DarwinAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NetworkAdapter for DarwinAdapter {
    async fn create_tap(
        &self,
        _name: &str,
        _host_ip: Ipv4Addr,
        _vm_ip: Ipv4Addr,
        _mask: Ipv4Addr,
    ) -> Result<()> {
        // The hypervisor manages the vmnet interface itself.
        Ok(())
    }

    async fn destroy_tap(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn save_config(&self) -> Result<SavedConfig> {
        let data = run_capture("netstat", &["-rn"])
            .await
            .context("save routes")?;
        Ok(SavedConfig {
            platform: "darwin",
            data,
            hmac: None,
        })
    }

    async fn restore_config(&self, saved: &SavedConfig) -> Result<()> {
        if saved.platform != "darwin" {
            bail!("saved config is for {:?}, not darwin", saved.platform);
        }
        // Route restoration is handled by teardown_routing.
        Ok(())
    }

    async fn setup_routing(&self, _tap_name: &str, vm_ip: Ipv4Addr) -> Result<()> {
        let via = vm_ip.to_string();
        run("route", &["-n", "add", "-net", "0.0.0.0/1", &via])
            .await
            .context("add route 0.0.0.0/1")?;
        run("route", &["-n", "add", "-net", "128.0.0.0/1", &via])
            .await
            .context("add route 128.0.0.0/1")?;
        info!(via = %via, "installed half-default diversion routes");
        Ok(())
    }

    async fn teardown_routing(&self) -> Result<()> {
        for net in ["0.0.0.0/1", "128.0.0.0/1"] {
            if let Err(e) = run("route", &["-n", "delete", "-net", net]).await {
                warn!(net, "diversion route removal: {:#}", e);
            }
        }
        Ok(())
    }

    async fn flush_dns(&self) -> Result<()> {
        let _ = run("dscacheutil", &["-flushcache"]).await;
        let _ = run("killall", &["-HUP", "mDNSResponder"]).await;
        Ok(())
    }
}
