//! Linux network adapter: TAP via iproute2, diversion via a metric-50
//! default route, DNS cache flush via systemd-resolved.

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use super::command::{run, run_capture};
use super::{mask_prefix_len, NetworkAdapter, SavedConfig};

pub struct LinuxAdapter;

impl LinuxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NetworkAdapter for LinuxAdapter {
    async fn create_tap(
        &self,
        name: &str,
        host_ip: Ipv4Addr,
        _vm_ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<()> {
        run("ip", &["tuntap", "add", "dev", name, "mode", "tap"])
            .await
            .context("create tap")?;

        let cidr = format!("{}/{}", host_ip, mask_prefix_len(mask));
        run("ip", &["addr", "add", &cidr, "dev", name])
            .await
            .context("set tap address")?;

        run("ip", &["link", "set", name, "up"])
            .await
            .context("bring tap up")?;

        info!(tap = name, addr = %cidr, "created TAP device");
        Ok(())
    }

    async fn destroy_tap(&self, name: &str) -> Result<()> {
        run("ip", &["tuntap", "del", "dev", name, "mode", "tap"]).await
    }

    async fn save_config(&self) -> Result<SavedConfig> {
        let data = run_capture("ip", &["route", "show"])
            .await
            .context("save routes")?;
        Ok(SavedConfig {
            platform: "linux",
            data,
            hmac: None,
        })
    }

    async fn restore_config(&self, saved: &SavedConfig) -> Result<()> {
        if saved.platform != "linux" {
            bail!("saved config is for {:?}, not linux", saved.platform);
        }
        // Route restoration is handled by teardown_routing, which removes
        // the specific route we added. The kernel drops the TAP-scoped
        // entries when the device is destroyed.
        Ok(())
    }

    async fn setup_routing(&self, tap_name: &str, vm_ip: Ipv4Addr) -> Result<()> {
        let via = vm_ip.to_string();
        run(
            "ip",
            &[
                "route", "add", "default", "via", &via, "dev", tap_name, "metric", "50",
            ],
        )
        .await
        .context("add default route")?;
        info!(via = %via, dev = tap_name, "installed diversion route");
        Ok(())
    }

    async fn teardown_routing(&self) -> Result<()> {
        // Errors are expected when the route was already cleaned up.
        if let Err(e) = run("ip", &["route", "del", "default", "metric", "50"]).await {
            warn!("diversion route removal: {:#}", e);
        }
        Ok(())
    }

    async fn flush_dns(&self) -> Result<()> {
        // systemd-resolved; hosts running something else simply won't have
        // the tool and the caller treats this as best-effort.
        let _ = run("resolvectl", &["flush-caches"]).await;
        Ok(())
    }
}
