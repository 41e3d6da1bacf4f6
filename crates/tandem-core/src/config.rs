//! Configuration for IPC instances.
//!
//! `IpcDefaults` holds the reference constants; `IpcConfig` is the value
//! passed into the parent and child constructors.

use crate::registry::{Endpoint, Registry};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reference constants for the IPC runtime.
pub struct IpcDefaults;

impl IpcDefaults {
    /// Flag the parent appends to the child's arguments, followed by the socket path.
    pub const SOCKET_FLAG: &'static str = "--ipc-socket";
    /// Maximum size of one wire record, excluding the trailing newline.
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB
    /// How long the parent waits for the child to dial in.
    pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
    /// File name prefix of the parent's socket.
    pub const SOCKET_PREFIX: &'static str = "tandem-ipc";
}

/// Per-instance configuration.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Reserved argument carrying the socket path to the child.
    pub socket_flag: String,
    /// Maximum record size accepted or produced.
    pub max_frame_size: usize,
    /// Bound on the parent's accept step.
    pub accept_timeout: Duration,
    /// Directory the parent creates its socket in.
    pub socket_dir: PathBuf,
    /// Local endpoints exposed to the remote side.
    pub registry: Registry,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_flag: IpcDefaults::SOCKET_FLAG.to_string(),
            max_frame_size: IpcDefaults::MAX_FRAME_SIZE,
            accept_timeout: IpcDefaults::ACCEPT_TIMEOUT,
            socket_dir: std::env::temp_dir(),
            registry: Registry::default(),
        }
    }
}

impl IpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a local endpoint, keyed by its name.
    pub fn register(mut self, endpoint: Endpoint) -> Self {
        self.registry.insert(endpoint);
        self
    }

    /// Expose several local endpoints.
    pub fn register_all(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        for endpoint in endpoints {
            self.registry.insert(endpoint);
        }
        self
    }

    /// Set the reserved socket flag.
    pub fn with_socket_flag(mut self, flag: impl Into<String>) -> Self {
        self.socket_flag = flag.into();
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Set the accept timeout.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the directory for the parent's socket.
    pub fn with_socket_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.socket_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Socket path for a new parent instance.
    ///
    /// Includes the pid and a random suffix so several parents in one
    /// process never share a path.
    pub(crate) fn new_socket_path(&self) -> PathBuf {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.socket_dir.join(format!(
            "{}-{}-{}.sock",
            IpcDefaults::SOCKET_PREFIX,
            std::process::id(),
            suffix.get(..12).unwrap_or(&suffix)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IpcConfig::default();
        assert_eq!(config.socket_flag, "--ipc-socket");
        assert_eq!(config.max_frame_size, 1 << 30);
        assert_eq!(config.accept_timeout, Duration::from_secs(10));
        assert!(config.registry.is_empty());
    }

    #[test]
    fn test_socket_paths_are_unique() {
        let config = IpcConfig::new().with_socket_dir("/tmp");
        let a = config.new_socket_path();
        let b = config.new_socket_path();
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp"));
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("tandem-ipc-"));
        assert!(name.ends_with(".sock"));
    }

    #[test]
    fn test_builder_overrides() {
        let config = IpcConfig::new()
            .with_socket_flag("--sock")
            .with_max_frame_size(64)
            .with_accept_timeout(Duration::from_millis(250))
            .register(Endpoint::new("Math").build());
        assert_eq!(config.socket_flag, "--sock");
        assert_eq!(config.max_frame_size, 64);
        assert_eq!(config.accept_timeout, Duration::from_millis(250));
        assert!(config.registry.get("Math").is_some());
    }
}
