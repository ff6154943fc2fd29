//! Hardware virtualization capability detection.
//!
//! Probes run at startup against the detected operating system; the result
//! feeds acceleration selection and the optional QEMU fast paths
//! (vhost-net, IOMMU). Detection never fails hard: anything unprobeable
//! falls back to software emulation.

use anyhow::{bail, Result};

/// QEMU acceleration backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    Kvm,
    Hvf,
    Whpx,
    Tcg,
}

impl Accel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accel::Kvm => "kvm",
            Accel::Hvf => "hvf",
            Accel::Whpx => "whpx",
            Accel::Tcg => "tcg",
        }
    }

    /// Convert a user-supplied string to an acceleration backend.
    pub fn parse(s: &str) -> Result<Accel> {
        match s {
            "kvm" => Ok(Accel::Kvm),
            "hvf" => Ok(Accel::Hvf),
            "whpx" => Ok(Accel::Whpx),
            "tcg" => Ok(Accel::Tcg),
            other => bail!("unknown accelerator: {:?}", other),
        }
    }
}

/// Detected platform capabilities.
#[derive(Debug, Clone, Copy)]
pub struct Info {
    pub accel: Accel,
    /// Linux: kernel vhost-net available for virtio-net
    pub vhost_net: bool,
    /// Linux: IOMMU (VT-d / AMD-Vi) groups present
    pub iommu: bool,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            accel: Accel::Tcg,
            vhost_net: false,
            iommu: false,
        }
    }
}

/// Probe the current platform for hardware virtualization capabilities.
pub async fn detect() -> Info {
    match std::env::consts::OS {
        "linux" => detect_linux(),
        "macos" => detect_macos().await,
        "windows" => detect_windows().await,
        _ => Info::default(),
    }
}

fn detect_linux() -> Info {
    let mut info = Info::default();

    // KVM is usable when /dev/kvm can be opened read-write.
    if std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
        .is_ok()
    {
        info.accel = Accel::Kvm;
    }

    // vhost-net moves virtio packet processing into the kernel, bypassing
    // QEMU userspace for each packet.
    if std::path::Path::new("/dev/vhost-net").exists() {
        info.vhost_net = true;
    }

    // IOMMU groups exist only when the kernel has an IOMMU enabled.
    if let Ok(mut entries) = std::fs::read_dir("/sys/kernel/iommu_groups") {
        if entries.next().is_some() {
            info.iommu = true;
        }
    }

    info
}

async fn detect_macos() -> Info {
    let mut info = Info::default();

    let out = tokio::process::Command::new("sysctl")
        .args(["-n", "kern.hv_support"])
        .output()
        .await;
    if let Ok(out) = out {
        if String::from_utf8_lossy(&out.stdout).trim() == "1" {
            info.accel = Accel::Hvf;
        }
    }

    // macOS has no vhost-net kernel module and no IOMMU passthrough in QEMU.
    info
}

async fn detect_windows() -> Info {
    let mut info = Info::default();

    let out = tokio::process::Command::new("systeminfo").output().await;
    if let Ok(out) = out {
        let text = String::from_utf8_lossy(&out.stdout).to_lowercase();
        if text.contains("hypervisor has been detected") {
            info.accel = Accel::Whpx;
        }
    }

    info
}
