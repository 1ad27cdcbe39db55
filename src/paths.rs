//! Centralized path resolution for a sockd service.
//!
//! Single source of truth for the on-disk coordination artifacts shared by
//! daemons and clients of one service: everything lives under
//! `.{service_name}/daemon/` relative to a root directory (by default the
//! process working directory, so invocations sharing a working directory
//! share a daemon).

use crate::error::{Result, SockdError};
use std::path::{Path, PathBuf};

/// On-disk layout for one service's daemon coordination directory.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    service_name: String,
    dir: PathBuf,
}

impl ServicePaths {
    /// Layout rooted at an explicit directory.
    pub fn in_dir(root: impl AsRef<Path>, service_name: &str) -> Result<Self> {
        if service_name.is_empty() {
            return Err(SockdError::config_error("service name must not be empty"));
        }
        if service_name.contains(['/', '\\']) {
            return Err(SockdError::config_error(format!(
                "service name must not contain path separators: {service_name:?}"
            )));
        }
        let dir = root
            .as_ref()
            .join(format!(".{service_name}"))
            .join("daemon");
        Ok(Self {
            service_name: service_name.to_string(),
            dir,
        })
    }

    /// Layout rooted at the current working directory.
    pub fn from_cwd(service_name: &str) -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| SockdError::io_error("Failed to resolve working directory", e))?;
        Self::in_dir(cwd, service_name)
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The coordination directory itself (`.{name}/daemon`).
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The IPC endpoint path.
    ///
    /// On Windows the filesystem path maps onto a named-pipe identifier; on
    /// POSIX it is the unix-domain socket path as-is.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.dir.join("socket")
    }

    /// Decimal PID of the live daemon; present iff one considers itself live.
    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.dir.join("pid")
    }

    /// Script mtime recorded by the live daemon at startup.
    #[must_use]
    pub fn mtime_path(&self) -> PathBuf {
        self.dir.join("mtime")
    }

    /// Exclusive-create startup lock.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("starting.lock")
    }

    /// Append-only log file a spawned daemon inherits as stderr.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    /// Env var naming the daemon's own script, set by the spawning client and
    /// read back by the server for mtime-based restart detection.
    #[must_use]
    pub fn script_env_var(&self) -> String {
        format!("SOCK_DAEMON_SCRIPT_{}", self.service_name)
    }
}

/// Map an endpoint path to the named-pipe identifier used on Windows.
///
/// Both sides of a connection must agree on this mapping, so it is defined
/// here rather than in the transport.
#[must_use]
pub fn windows_pipe_name(socket_path: &Path) -> String {
    let flat = socket_path.to_string_lossy().replace('\\', "/");
    format!("\\\\?\\pipe\\{flat}")
}

/// Env var selecting verbose daemon logging, injected by a `debug` client.
pub const DEBUG_ENV_VAR: &str = "RUST_LOG";

/// Env filter value the client injects when spawned with `debug`.
pub const DEBUG_ENV_VALUE: &str = "sockd=debug";
