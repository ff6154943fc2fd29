//! Writing overlay files into the ext4 state disk image.
//!
//! `debugfs -w` edits the image without root or mount privileges. Both the
//! guest path and every host path that ends up inside the debugfs command
//! string are validated against conservative character allowlists first.

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::network::command;

fn safe_host_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9/_.\-]+$").unwrap())
}

fn guest_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/-]*$").unwrap())
}

fn validate_guest_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("guest path must not be empty");
    }
    if path.len() > 255 {
        bail!("guest path too long ({} chars, max 255)", path.len());
    }
    if path.contains("..") {
        bail!("guest path must not contain '..'");
    }
    if !guest_path_re().is_match(path) {
        bail!("guest path contains invalid characters: {:?}", path);
    }
    Ok(())
}

/// Write `content` to `guest_path` inside the ext4 image at `disk_path`.
pub async fn write_state_disk_file(disk_path: &str, guest_path: &str, content: &str) -> Result<()> {
    validate_guest_path(guest_path).context("invalid guest path")?;

    let disk_path = std::fs::canonicalize(disk_path).context("resolve disk path")?;
    let meta = std::fs::metadata(&disk_path).context("stat disk image")?;
    if !meta.is_file() {
        bail!("disk path is not a regular file: {}", disk_path.display());
    }

    // Stage the content next to the image so debugfs reads a co-located file.
    let tmp_dir = disk_path
        .parent()
        .filter(|d: &&Path| d.is_dir())
        .map(|d| d.to_path_buf())
        .unwrap_or_else(std::env::temp_dir);
    let mut tmp = tempfile::Builder::new()
        .prefix("torvm-overlay-")
        .tempfile_in(tmp_dir)
        .context("create temp file")?;
    tmp.write_all(content.as_bytes()).context("write temp file")?;
    tmp.flush().context("flush temp file")?;

    let tmp_path = tmp.path().to_string_lossy().into_owned();
    let disk_str = disk_path.to_string_lossy().into_owned();
    if !safe_host_path_re().is_match(&tmp_path) {
        bail!("temp file path contains unsafe characters: {:?}", tmp_path);
    }
    if !safe_host_path_re().is_match(&disk_str) {
        bail!("disk path contains unsafe characters: {:?}", disk_str);
    }

    let write_cmd = format!("write \"{}\" {}", tmp_path, guest_path);
    command::run("debugfs", &["-w", "-R", &write_cmd, &disk_str])
        .await
        .context("debugfs write")?;
    Ok(())
}
