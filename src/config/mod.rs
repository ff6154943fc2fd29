pub mod torrc;

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Characters that must never appear in an interface name handed to
/// external tools.
const TAP_NAME_FORBIDDEN: &str = ";|&$`\\\"'<>(){}!\n\r";

/// Tor bridge and pluggable transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub use_bridges: bool,
    /// "", "none", "obfs4", "meek-lite", "snowflake"
    #[serde(default)]
    pub transport: String,
    /// Bridge lines (address:port fingerprint)
    #[serde(default)]
    pub bridges: Vec<String>,
}

/// Upstream proxy settings for Tor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// "", "http", "https", "socks5"
    #[serde(default, rename = "type")]
    pub kind: String,
    /// host:port
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// All configuration for the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tap_name: String,
    pub host_ip: String,
    pub vm_ip: String,
    pub subnet_mask: String,
    pub dns1: String,
    pub dns2: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub trans_port: u16,
    pub dns_port: u16,
    pub vm_memory_mb: u32,
    pub vm_cpus: u32,
    pub kernel_path: String,
    pub initrd_path: String,
    pub state_disk_path: String,
    pub qmp_socket_path: String,
    pub verbose: bool,
    pub accel: String,
    pub headless: bool,

    // Runtime-detected platform capabilities (not persisted).
    #[serde(skip)]
    pub vhost_net: bool,
    #[serde(skip)]
    pub iommu_enabled: bool,

    pub bridge: BridgeConfig,
    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        let tap_name = if std::env::consts::OS == "windows" {
            "TorVM Tap".to_string()
        } else {
            "torvm0".to_string()
        };

        Self {
            tap_name,
            host_ip: "10.10.10.2".to_string(),
            vm_ip: "10.10.10.1".to_string(),
            subnet_mask: "255.255.255.252".to_string(),
            dns1: "4.2.2.4".to_string(),
            dns2: "4.2.2.2".to_string(),
            socks_port: 9050,
            control_port: 9051,
            trans_port: 9095,
            dns_port: 9093,
            vm_memory_mb: 128,
            vm_cpus: 2,
            kernel_path: "dist/vm/vmlinuz".to_string(),
            initrd_path: "dist/vm/initramfs.gz".to_string(),
            state_disk_path: "dist/vm/state.img".to_string(),
            qmp_socket_path: default_qmp_path(),
            verbose: false,
            accel: String::new(),
            headless: false,
            vhost_net: false,
            iommu_enabled: false,
            bridge: BridgeConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Read configuration from a JSON file and merge it with defaults.
    /// A missing file yields the validated defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            let cfg = Config::default();
            cfg.validate().context("default config invalid")?;
            return Ok(cfg);
        };

        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Config::default();
                cfg.validate().context("default config invalid")?;
                return Ok(cfg);
            }
            Err(e) => return Err(e).with_context(|| format!("reading config {}", path)),
        };

        check_file_mode(Path::new(path))?;

        let cfg: Config =
            serde_json::from_str(&data).with_context(|| format!("parsing config {}", path))?;
        cfg.validate().context("config validation")?;
        Ok(cfg)
    }

    /// Check all fields for safety and correctness.
    pub fn validate(&self) -> Result<()> {
        for (name, val) in [
            ("host_ip", &self.host_ip),
            ("vm_ip", &self.vm_ip),
            ("subnet_mask", &self.subnet_mask),
            ("dns1", &self.dns1),
            ("dns2", &self.dns2),
        ] {
            val.parse::<Ipv4Addr>()
                .with_context(|| format!("invalid IP for {}: {:?}", name, val))?;
        }

        for (name, port) in [
            ("socks_port", self.socks_port),
            ("control_port", self.control_port),
            ("trans_port", self.trans_port),
            ("dns_port", self.dns_port),
        ] {
            if port == 0 {
                bail!("{} must be 1-65535, got {}", name, port);
            }
        }

        if !(32..=4096).contains(&self.vm_memory_mb) {
            bail!("vm_memory_mb must be 32-4096, got {}", self.vm_memory_mb);
        }
        if !(1..=16).contains(&self.vm_cpus) {
            bail!("vm_cpus must be 1-16, got {}", self.vm_cpus);
        }

        for (name, val) in [
            ("kernel_path", &self.kernel_path),
            ("initrd_path", &self.initrd_path),
            ("state_disk_path", &self.state_disk_path),
            ("qmp_socket_path", &self.qmp_socket_path),
        ] {
            if val.is_empty() {
                bail!("{} must not be empty", name);
            }
        }

        if self.tap_name.is_empty() {
            bail!("tap_name must not be empty");
        }
        if self.tap_name.chars().any(|c| TAP_NAME_FORBIDDEN.contains(c)) {
            bail!("tap_name contains invalid characters: {:?}", self.tap_name);
        }

        match self.accel.as_str() {
            "" | "kvm" | "hvf" | "whpx" | "tcg" => {}
            other => bail!("invalid accel: {:?}", other),
        }

        match self.proxy.kind.as_str() {
            "" | "http" | "https" | "socks5" => {}
            other => bail!("invalid proxy type: {:?}", other),
        }

        match self.bridge.transport.as_str() {
            "" | "none" | "obfs4" | "meek-lite" | "snowflake" => {}
            other => bail!("invalid bridge transport: {:?}", other),
        }

        Ok(())
    }
}

/// The config file may carry proxy credentials; refuse group/world access.
fn check_file_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat config {}", path.display()))?;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            bail!(
                "config file {} has mode {:o}; must be 0600 or stricter",
                path.display(),
                mode
            );
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn default_qmp_path() -> String {
    if std::env::consts::OS == "windows" {
        r"\\.\pipe\torvm-qmp".to_string()
    } else {
        "/run/torvm/qmp.sock".to_string()
    }
}
