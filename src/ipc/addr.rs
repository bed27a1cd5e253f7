// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bootstrap address parsing (§4.6 "Addressing"). The protocol prefix
// selects UNIX or AF_VSOCK; a bare string with no `://` falls back to a
// UNIX socket relative to the run path, matching the upstream parser.

use std::path::PathBuf;

use crate::config::{DEFAULT_VSOCK_PORT, IoConfig};
use crate::error::{IoError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAddr {
    Unix { path: PathBuf },
    Vsock { cid: u32, port: u32 },
}

/// `VMADDR_CID_ANY`, used when a `vsock://` address omits the cid.
pub const VMADDR_CID_ANY: u32 = 0xFFFF_FFFF;

impl BootstrapAddr {
    pub fn parse(config: &IoConfig, raw: &str) -> Result<Self> {
        if let Some(name) = raw.strip_prefix("unix://") {
            return Ok(Self::Unix { path: config.namespace_dir().join(name) });
        }
        if let Some(rest) = raw.strip_prefix("vsock://") {
            return Self::parse_vsock(rest);
        }
        if raw.contains("://") {
            return Err(IoError::InvalidAddress(raw.to_string()));
        }
        Ok(Self::Unix { path: config.namespace_dir().join(raw) })
    }

    fn parse_vsock(rest: &str) -> Result<Self> {
        let (cid_str, port_str) = match rest.split_once(':') {
            Some((c, p)) => (c, Some(p)),
            None => (rest, None),
        };
        let cid = if cid_str.is_empty() { VMADDR_CID_ANY } else { cid_str.parse().map_err(|_| IoError::InvalidAddress(rest.to_string()))? };
        let cid = if cid == 0 { VMADDR_CID_ANY } else { cid };
        let port = match port_str {
            Some(p) if !p.is_empty() => p.parse().map_err(|_| IoError::InvalidAddress(rest.to_string()))?,
            _ => DEFAULT_VSOCK_PORT,
        };
        Ok(Self::Vsock { cid, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoConfig;

    #[test]
    fn unix_prefix_is_relative_to_namespace_dir() {
        let cfg = IoConfig::ipc_secondary("unix://ctl", 1 << 20).with_run_path("/tmp/jbpf_test");
        let addr = BootstrapAddr::parse(&cfg, "unix://ctl").unwrap();
        assert_eq!(addr, BootstrapAddr::Unix { path: cfg.namespace_dir().join("ctl") });
    }

    #[test]
    fn bare_string_falls_back_to_unix() {
        let cfg = IoConfig::ipc_secondary("ctl", 1 << 20).with_run_path("/tmp/jbpf_test");
        let addr = BootstrapAddr::parse(&cfg, "ctl").unwrap();
        assert_eq!(addr, BootstrapAddr::Unix { path: cfg.namespace_dir().join("ctl") });
    }

    #[test]
    fn vsock_defaults_cid_any_and_default_port() {
        let cfg = IoConfig::ipc_secondary("vsock://", 1 << 20);
        let addr = BootstrapAddr::parse(&cfg, "vsock://").unwrap();
        assert_eq!(addr, BootstrapAddr::Vsock { cid: VMADDR_CID_ANY, port: DEFAULT_VSOCK_PORT });
    }

    #[test]
    fn vsock_with_cid_and_port() {
        let cfg = IoConfig::ipc_secondary("vsock://3:7000", 1 << 20);
        let addr = BootstrapAddr::parse(&cfg, "vsock://3:7000").unwrap();
        assert_eq!(addr, BootstrapAddr::Vsock { cid: 3, port: 7000 });
    }

    #[test]
    fn unrecognized_protocol_is_invalid() {
        let cfg = IoConfig::ipc_secondary("udp://x", 1 << 20);
        assert!(BootstrapAddr::parse(&cfg, "udp://x").is_err());
    }
}
