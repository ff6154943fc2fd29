//! Resolution and execution of external system tools.
//!
//! Every binary invoked on behalf of the controller is located through the
//! normal PATH search, then symlink-resolved, then required to live under a
//! per-platform allowlist of directories. A tool that resolves anywhere
//! else is rejected rather than executed.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Directories where system tools are expected to reside, per platform.
fn allowed_dirs(os: &str) -> &'static [&'static str] {
    match os {
        "linux" => &[
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/usr/local/bin",
            "/usr/local/sbin",
            "/snap/bin",
        ],
        "macos" => &[
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/opt/local/bin",
        ],
        "windows" => &[
            r"C:\Windows\System32",
            r"C:\Program Files",
            r"C:\Program Files (x86)",
        ],
        _ => &[],
    }
}

fn path_is_under(path: &Path, dir: &str, case_insensitive: bool) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    if case_insensitive {
        let parent = parent.to_string_lossy().to_lowercase();
        let dir = dir.to_lowercase();
        parent == dir || parent.starts_with(&format!("{}{}", dir, std::path::MAIN_SEPARATOR))
    } else {
        parent == Path::new(dir) || parent.starts_with(format!("{}/", dir))
    }
}

/// Locate `name` via PATH, resolve symlinks and validate the resolved path
/// is under an allowed directory.
pub fn resolve_tool(name: &str) -> Result<PathBuf> {
    let found = which::which(name).with_context(|| format!("{} not found in PATH", name))?;

    let resolved = std::fs::canonicalize(&found)
        .with_context(|| format!("resolving {} binary path", name))?;

    let os = std::env::consts::OS;
    let allowed = allowed_dirs(os);
    if allowed.is_empty() {
        // Unknown platform; accept any resolved path.
        return Ok(resolved);
    }

    let case_insensitive = os == "windows";
    for dir in allowed {
        if path_is_under(&resolved, dir, case_insensitive) {
            return Ok(resolved);
        }
    }

    bail!(
        "{} resolved to {:?}, outside the allowed directories {:?}",
        name,
        resolved,
        allowed
    )
}

/// Run a resolved system tool, failing with its combined output on a
/// non-zero exit.
pub async fn run(name: &str, args: &[&str]) -> Result<()> {
    let tool = resolve_tool(name)?;
    debug!(tool = %tool.display(), ?args, "running system tool");

    let out = tokio::process::Command::new(&tool)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {}", name))?;

    if !out.status.success() {
        let mut msg = String::from_utf8_lossy(&out.stdout).into_owned();
        msg.push_str(&String::from_utf8_lossy(&out.stderr));
        bail!("{} {:?}: {}: {}", name, args, out.status, msg.trim());
    }
    Ok(())
}

/// Run a resolved system tool and capture its stdout.
pub async fn run_capture(name: &str, args: &[&str]) -> Result<Vec<u8>> {
    let tool = resolve_tool(name)?;
    debug!(tool = %tool.display(), ?args, "running system tool");

    let out = tokio::process::Command::new(&tool)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {}", name))?;

    if !out.status.success() {
        bail!(
            "{} {:?}: {}: {}",
            name,
            args,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_respects_the_allowlist() {
        // `sh` lives under /bin or /usr/bin everywhere we run tests.
        if std::env::consts::OS == "linux" {
            let path = resolve_tool("sh").unwrap();
            assert!(path.is_absolute());
        }

        // A binary living in a scratch directory must be refused even when
        // PATH points straight at it. PATH is mutated and restored inside a
        // single test to keep `which` lookups in other tests undisturbed.
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ip");
        std::fs::write(&fake, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let old_path = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());
        let result = resolve_tool("ip");
        match old_path {
            Some(p) => std::env::set_var("PATH", p),
            None => std::env::remove_var("PATH"),
        }

        assert!(result.is_err());
    }

    #[test]
    fn path_prefix_matching_is_exact() {
        assert!(path_is_under(Path::new("/usr/bin/ip"), "/usr/bin", false));
        assert!(path_is_under(
            Path::new("/usr/bin/core/ip"),
            "/usr/bin",
            false
        ));
        assert!(!path_is_under(
            Path::new("/usr/bin-evil/ip"),
            "/usr/bin",
            false
        ));
    }
}
