//! Deterministic QEMU argument vector construction.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::security;

/// Build the QEMU command line from validated configuration, applying
/// platform-specific optimizations where the capability probes found them.
pub fn build_args(cfg: &Config) -> Result<Vec<String>> {
    // Reject paths containing NUL bytes before they reach the argv.
    for (name, path) in [
        ("kernel_path", &cfg.kernel_path),
        ("initrd_path", &cfg.initrd_path),
        ("state_disk_path", &cfg.state_disk_path),
        ("qmp_socket_path", &cfg.qmp_socket_path),
    ] {
        if path.contains('\0') {
            bail!("{} contains null byte", name);
        }
    }

    let accel = if cfg.accel.is_empty() {
        "tcg"
    } else {
        cfg.accel.as_str()
    };
    let cpu = if accel == "tcg" { "qemu64" } else { "host" };

    // Fresh guest entropy seed on every launch.
    let entropy = security::entropy_hex(32);

    let kernel_append = format!(
        "quiet IP={} MASK={} GW={} MTU=1500 PRIVIP={} CTLSOCK={}:{} ENTROPY={}",
        cfg.host_ip, cfg.subnet_mask, cfg.vm_ip, cfg.vm_ip, cfg.vm_ip, cfg.control_port, entropy,
    );

    let mut args: Vec<String> = vec![
        "-name".into(),
        "TorVM".into(),
        "-machine".into(),
        machine_arg(cfg, accel),
        "-cpu".into(),
        cpu.into(),
        "-accel".into(),
        accel.into(),
        "-smp".into(),
        cfg.vm_cpus.to_string(),
        "-m".into(),
        cfg.vm_memory_mb.to_string(),
        "-kernel".into(),
        cfg.kernel_path.clone(),
        "-initrd".into(),
        cfg.initrd_path.clone(),
        "-append".into(),
        kernel_append,
    ];

    args.extend(block_args(cfg, accel));

    // IOMMU device (VT-d) when supported with KVM.
    if cfg.iommu_enabled && accel == "kvm" {
        args.extend([
            "-device".to_string(),
            "intel-iommu,intremap=on,caching-mode=on".to_string(),
        ]);
    }

    args.extend(rng_args());

    // Virtio memory balloon for dynamic memory management.
    args.extend(["-device".to_string(), "virtio-balloon-pci".to_string()]);

    args.push("-nographic".into());

    args.extend(tap_args(cfg));

    // QMP monitor endpoint.
    let qmp = if std::env::consts::OS == "windows" {
        format!("pipe:{},server,nowait", cfg.qmp_socket_path)
    } else {
        format!("unix:{},server,nowait", cfg.qmp_socket_path)
    };
    args.extend(["-qmp".to_string(), qmp]);

    Ok(args)
}

/// The -machine value with platform-specific interrupt handling.
fn machine_arg(cfg: &Config, accel: &str) -> String {
    match accel {
        "kvm" => {
            if cfg.iommu_enabled {
                // IOMMU requires split irqchip: the kernel handles the
                // LAPIC, QEMU handles the IOAPIC with interrupt remapping
                // through the virtual IOMMU.
                "q35,kernel-irqchip=split".to_string()
            } else {
                // Offload the full interrupt controller to KVM.
                "q35,kernel-irqchip=on".to_string()
            }
        }
        _ => "q35".to_string(),
    }
}

/// State disk arguments with cache and I/O settings tuned per accelerator.
fn block_args(cfg: &Config, accel: &str) -> Vec<String> {
    let drive_opts = match accel {
        // Direct I/O with kernel async I/O bypasses the host page cache
        // and avoids double-caching.
        "kvm" => format!(
            "file={},id=drive0,if=none,format=raw,cache=none,aio=native",
            cfg.state_disk_path
        ),
        // Native AIO is unavailable on macOS and Windows.
        "hvf" | "whpx" => format!(
            "file={},id=drive0,if=none,format=raw,cache=writeback,aio=threads",
            cfg.state_disk_path
        ),
        _ => format!(
            "file={},id=drive0,if=none,format=raw,cache=writeback",
            cfg.state_disk_path
        ),
    };

    vec![
        "-drive".to_string(),
        drive_opts,
        "-device".to_string(),
        "virtio-blk-pci,drive=drive0".to_string(),
    ]
}

/// Virtio entropy device backed by the host RNG, so the guest has
/// high-quality entropy without relying on kernel command-line seeding
/// alone.
fn rng_args() -> Vec<String> {
    let backend = if std::env::consts::OS == "windows" {
        "rng-builtin,id=rng0".to_string()
    } else {
        "rng-random,id=rng0,filename=/dev/urandom".to_string()
    };

    vec![
        "-object".to_string(),
        backend,
        "-device".to_string(),
        "virtio-rng-pci,rng=rng0,max-bytes=1024,period=1000".to_string(),
    ]
}

/// Network device arguments, with vhost-net acceleration on Linux when the
/// kernel module was detected.
fn tap_args(cfg: &Config) -> Vec<String> {
    if std::env::consts::OS == "macos" {
        return vec![
            "-netdev".to_string(),
            format!(
                "vmnet-shared,id=net0,start-address={},end-address={},subnet-mask={}",
                cfg.vm_ip, cfg.host_ip, cfg.subnet_mask
            ),
            "-device".to_string(),
            "virtio-net-pci,netdev=net0".to_string(),
        ];
    }

    let mut netdev = format!(
        "tap,id=net0,ifname={},script=no,downscript=no",
        cfg.tap_name
    );
    if cfg.vhost_net && std::env::consts::OS == "linux" {
        netdev.push_str(",vhost=on");
    }

    vec![
        "-netdev".to_string(),
        netdev,
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
    ]
}
