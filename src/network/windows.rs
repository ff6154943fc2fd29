//! Windows network adapter.
//!
//! The saved network state on this platform is a `netsh interface ip dump`
//! script that is later re-executed by `netsh exec`. Because the blob sits
//! on disk between save and restore, the restore path demands two checks
//! before execution: a session-local HMAC-SHA256 over the bytes, and a
//! leading-token allowlist on every non-comment line.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{info, warn};

use super::command::{run, run_capture};
use super::{NetworkAdapter, SavedConfig};

type HmacSha256 = Hmac<Sha256>;

/// Leading tokens a netsh dump line may start with. Anything else aborts
/// the restore.
const SAFE_PREFIXES: &[&str] = &[
    "set address",
    "add address",
    "add dns",
    "set dns",
    "add wins",
    "set wins",
    "pushd",
    "popd",
    "set interface",
];

pub struct WindowsAdapter {
    state_dir: PathBuf,
    /// Session key for the HMAC over the saved dump. Fresh per process.
    session_key: [u8; 32],
}

impl WindowsAdapter {
    pub fn new() -> Self {
        // Derive the state directory from the executable's location rather
        // than the working directory, which could be attacker-controlled.
        let state_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|d| d.join("state")))
            .unwrap_or_else(|| PathBuf::from("state"));

        let mut session_key = [0u8; 32];
        OsRng.fill_bytes(&mut session_key);

        Self {
            state_dir,
            session_key,
        }
    }

    fn compute_hmac(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.session_key).expect("hmac accepts any key");
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_hmac(&self, data: &[u8], expected: Option<&str>) -> Result<()> {
        let Some(expected) = expected else {
            bail!("saved config has no HMAC; integrity cannot be verified");
        };
        let expected = hex::decode(expected).context("saved config HMAC is not hex")?;
        let mut mac = HmacSha256::new_from_slice(&self.session_key).expect("hmac accepts any key");
        mac.update(data);
        mac.verify_slice(&expected)
            .map_err(|_| anyhow::anyhow!("saved config HMAC mismatch; possible tampering"))
    }
}

impl Default for WindowsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that every non-empty, non-comment line starts with a known-safe
/// prefix, so a tampered dump cannot smuggle arbitrary netsh commands.
fn validate_netsh_dump(data: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(data);
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.to_lowercase().starts_with("rem ") {
            continue;
        }
        let lower = line.to_lowercase();
        if !SAFE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            bail!(
                "netsh dump line {} has unexpected content: {:?}",
                idx + 1,
                line
            );
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl NetworkAdapter for WindowsAdapter {
    async fn create_tap(
        &self,
        name: &str,
        host_ip: Ipv4Addr,
        vm_ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<()> {
        // The TAP driver adapter is pre-installed; address it statically
        // with the VM as gateway.
        run(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "address",
                name,
                "static",
                &host_ip.to_string(),
                &mask.to_string(),
                &vm_ip.to_string(),
                "1",
            ],
        )
        .await
        .context("configure tap address")?;
        Ok(())
    }

    async fn destroy_tap(&self, name: &str) -> Result<()> {
        // Remove the IP configuration; the adapter itself persists.
        let _ = run(
            "netsh",
            &["interface", "ip", "delete", "address", name, "all"],
        )
        .await;
        Ok(())
    }

    async fn save_config(&self) -> Result<SavedConfig> {
        let data = run_capture("netsh", &["interface", "ip", "dump"])
            .await
            .context("netsh dump")?;

        std::fs::create_dir_all(&self.state_dir).context("create state dir")?;
        let save_path = self.state_dir.join("netcfg.save");
        std::fs::write(&save_path, &data).context("write netcfg save")?;

        let hmac = self.compute_hmac(&data);
        Ok(SavedConfig {
            platform: "windows",
            data,
            hmac: Some(hmac),
        })
    }

    async fn restore_config(&self, saved: &SavedConfig) -> Result<()> {
        if saved.platform != "windows" {
            bail!("saved config is for {:?}, not windows", saved.platform);
        }

        self.verify_hmac(&saved.data, saved.hmac.as_deref())
            .context("saved config integrity check failed")?;
        validate_netsh_dump(&saved.data).context("netsh dump validation failed")?;

        let save_path = self.state_dir.join("netcfg.save");
        std::fs::write(&save_path, &saved.data).context("write netcfg for restore")?;

        let exec = run("netsh", &["exec", &save_path.to_string_lossy()]).await;
        let _ = std::fs::remove_file(&save_path);
        exec.context("netsh exec restore")?;

        info!("restored saved network configuration");
        Ok(())
    }

    async fn setup_routing(&self, tap_name: &str, _vm_ip: Ipv4Addr) -> Result<()> {
        // Traffic already egresses via the TAP default gateway configured in
        // create_tap; pin the tunnel DNS servers onto the adapter.
        run(
            "netsh",
            &["interface", "ip", "set", "dns", tap_name, "static", "4.2.2.4"],
        )
        .await
        .context("set dns1")?;
        run("netsh", &["interface", "ip", "add", "dns", tap_name, "4.2.2.2"])
            .await
            .context("set dns2")?;
        Ok(())
    }

    async fn teardown_routing(&self) -> Result<()> {
        Ok(())
    }

    async fn flush_dns(&self) -> Result<()> {
        if let Err(e) = run("ipconfig", &["/flushdns"]).await {
            warn!("flush dns: {:#}", e);
        }
        Ok(())
    }
}
