//! Torrc overlay generation from bridge and proxy settings.
//!
//! Every value that ends up in the overlay is validated against newline and
//! control-character injection plus a per-field character allowlist before a
//! single directive line is emitted.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::OnceLock;

use super::Config;

const MAX_CREDENTIAL_LEN: usize = 255;
const MAX_BRIDGE_LINE_LEN: usize = 1024;

/// A bridge line carries a transport name, IP:port, a hex fingerprint and
/// optional key=value parameters. Anything outside this set is rejected.
fn bridge_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9.:\[\] /=,+_-]+$").unwrap())
}

/// Proxy credentials: printable ASCII minus characters that would break
/// torrc parsing.
fn credential_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9!@#$%^&*()_+=\[\]{}<>,.?/~-]+$").unwrap())
}

/// Reject values containing newlines or other control characters that could
/// inject additional torrc directives.
fn sanitize_line(field: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        bail!("torrc {} contains newline characters", field);
    }
    for c in value.chars() {
        if (c as u32) < 32 || c == '\u{7f}' {
            bail!("torrc {} contains control character {:#04x}", field, c as u32);
        }
    }
    Ok(())
}

fn validate_bridge_line(line: &str) -> Result<()> {
    sanitize_line("bridge", line)?;
    if line.len() > MAX_BRIDGE_LINE_LEN {
        bail!(
            "bridge line too long ({} chars, max {})",
            line.len(),
            MAX_BRIDGE_LINE_LEN
        );
    }
    if !bridge_line_re().is_match(line) {
        bail!("bridge line contains invalid characters: {:?}", line);
    }
    Ok(())
}

fn validate_proxy_address(addr: &str) -> Result<()> {
    sanitize_line("proxy address", addr)?;
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("proxy address {:?} is not host:port", addr);
    };
    if host.is_empty() {
        bail!("proxy address has empty host");
    }
    if port.is_empty() || port.parse::<u16>().is_err() {
        bail!("proxy address {:?} has invalid port", addr);
    }
    Ok(())
}

fn validate_credential(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    sanitize_line(field, value)?;
    if value.len() > MAX_CREDENTIAL_LEN {
        bail!(
            "{} too long ({} chars, max {})",
            field,
            value.len(),
            MAX_CREDENTIAL_LEN
        );
    }
    if !credential_re().is_match(value) {
        bail!("{} contains invalid characters", field);
    }
    Ok(())
}

impl Config {
    /// Generate torrc directive lines from bridge and proxy settings.
    /// Returns an empty string when no overlay is needed.
    pub fn torrc_overlay(&self) -> Result<String> {
        let mut lines: Vec<String> = Vec::new();

        if self.bridge.use_bridges {
            lines.push("UseBridges 1".to_string());

            match self.bridge.transport.as_str() {
                "obfs4" => lines
                    .push("ClientTransportPlugin obfs4 exec /usr/bin/obfs4proxy".to_string()),
                "meek-lite" => lines
                    .push("ClientTransportPlugin meek_lite exec /usr/bin/obfs4proxy".to_string()),
                "snowflake" => lines.push(
                    "ClientTransportPlugin snowflake exec /usr/bin/snowflake-client".to_string(),
                ),
                "" | "none" => {}
                other => bail!("unsupported bridge transport: {:?}", other),
            }

            for bridge in &self.bridge.bridges {
                let bridge = bridge.trim();
                if bridge.is_empty() {
                    continue;
                }
                validate_bridge_line(bridge)?;
                lines.push(format!("Bridge {}", bridge));
            }
        }

        if !self.proxy.kind.is_empty() && !self.proxy.address.is_empty() {
            validate_proxy_address(&self.proxy.address)?;
            validate_credential("proxy username", &self.proxy.username)?;
            validate_credential("proxy password", &self.proxy.password)?;

            match self.proxy.kind.to_lowercase().as_str() {
                "http" => {
                    lines.push(format!("HTTPProxy {}", self.proxy.address));
                    if !self.proxy.username.is_empty() {
                        lines.push(format!(
                            "HTTPProxyAuthenticator {}:{}",
                            self.proxy.username, self.proxy.password
                        ));
                    }
                }
                "https" => {
                    lines.push(format!("HTTPSProxy {}", self.proxy.address));
                    if !self.proxy.username.is_empty() {
                        lines.push(format!(
                            "HTTPSProxyAuthenticator {}:{}",
                            self.proxy.username, self.proxy.password
                        ));
                    }
                }
                "socks5" => {
                    lines.push(format!("Socks5Proxy {}", self.proxy.address));
                    if !self.proxy.username.is_empty() {
                        lines.push(format!("Socks5ProxyUsername {}", self.proxy.username));
                        lines.push(format!("Socks5ProxyPassword {}", self.proxy.password));
                    }
                }
                _ => {}
            }
        }

        if lines.is_empty() {
            return Ok(String::new());
        }
        Ok(lines.join("\n") + "\n")
    }
}
