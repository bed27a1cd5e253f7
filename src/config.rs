// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// io_ctx configuration: the caller-populated struct that selects local vs.
// IPC operation and carries the run-directory / namespace layout.

use std::path::{Path, PathBuf};

/// Default vsock port when a `vsock://` address omits one.
pub const DEFAULT_VSOCK_PORT: u32 = 9999;

/// Default namespace subdirectory under the run path.
pub const DEFAULT_NAMESPACE: &str = "jbpf";

/// Environment variable overriding the run-directory root.
pub const RUN_PATH_ENV: &str = "JBPF_RUN_PATH";

/// Fallback run-directory root when `JBPF_RUN_PATH` is unset.
pub const DEFAULT_RUN_PATH: &str = "/tmp/jbpf";

/// The three `io_ctx` roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    LocalPrimary,
    IpcPrimary,
    IpcSecondary,
}

/// Local-primary configuration: just the arena size.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub mem_size: usize,
}

/// IPC configuration: bootstrap address plus the per-peer arena size the
/// primary offers (and the secondary requests).
#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub bootstrap_addr: String,
    pub mem_size: usize,
}

#[derive(Debug, Clone)]
pub enum RoleConfig {
    Local(LocalConfig),
    Ipc(IpcConfig),
}

/// Top-level `io_ctx` configuration.
#[derive(Debug, Clone)]
pub struct IoConfig {
    pub io_type: IoType,
    pub run_path: PathBuf,
    pub namespace: String,
    pub role: RoleConfig,
}

impl IoConfig {
    /// A local-primary config with the given arena size, defaults otherwise.
    pub fn local_primary(mem_size: usize) -> Self {
        Self {
            io_type: IoType::LocalPrimary,
            run_path: default_run_path(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            role: RoleConfig::Local(LocalConfig { mem_size }),
        }
    }

    /// An IPC-primary config listening on `bootstrap_addr`.
    pub fn ipc_primary(bootstrap_addr: impl Into<String>, mem_size: usize) -> Self {
        Self {
            io_type: IoType::IpcPrimary,
            run_path: default_run_path(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            role: RoleConfig::Ipc(IpcConfig { bootstrap_addr: bootstrap_addr.into(), mem_size }),
        }
    }

    /// An IPC-secondary config connecting to `bootstrap_addr`.
    pub fn ipc_secondary(bootstrap_addr: impl Into<String>, mem_size: usize) -> Self {
        Self {
            io_type: IoType::IpcSecondary,
            run_path: default_run_path(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            role: RoleConfig::Ipc(IpcConfig { bootstrap_addr: bootstrap_addr.into(), mem_size }),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_run_path(mut self, run_path: impl Into<PathBuf>) -> Self {
        self.run_path = run_path.into();
        self
    }

    /// `<run_path>/<namespace>`, created with `rwxrwxrwx` on first use by the caller.
    pub fn namespace_dir(&self) -> PathBuf {
        self.run_path.join(&self.namespace)
    }
}

fn default_run_path() -> PathBuf {
    std::env::var_os(RUN_PATH_ENV).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_RUN_PATH))
}

/// Create `<run_path>/<namespace>` with world read/write/execute permissions
/// if it does not already exist, matching the run-directory layout contract.
pub fn ensure_namespace_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perm = std::fs::Permissions::from_mode(0o777);
        std::fs::set_permissions(dir, perm)?;
    }
    Ok(())
}
