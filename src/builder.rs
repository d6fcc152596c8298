//! ServerBuilder for configuring the server.

use std::path::PathBuf;

use concerto_core::EngineConfig;

use crate::error::{Error, Result};
use crate::server::{Server, ServerOptions};

/// Builder for [`Server`].
///
/// # Example
///
/// ```ignore
/// let mut server = ServerBuilder::default()
///     .socket_path("/run/concerto/concerto.sock")
///     .config_dir("/etc/concerto")
///     .build()?;
/// server.run()?;
/// ```
pub struct ServerBuilder {
    socket_path: PathBuf,
    capture_socket_path: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    loopback_devices: bool,
    severe_underrun_frames: u32,
    rt_priority: Option<i32>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/concerto/concerto.sock"),
            capture_socket_path: None,
            config_dir: None,
            loopback_devices: true,
            severe_underrun_frames: 480,
            rt_priority: Some(10),
        }
    }
}

impl ServerBuilder {
    /// Path of the main control socket.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Optional second socket whose clients are capture-only.
    pub fn capture_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.capture_socket_path = Some(path.into());
        self
    }

    /// Directory holding `device_blocklist` and per-card config files.
    pub fn config_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(path.into());
        self
    }

    /// Whether to create the three loopback tap devices (default: true).
    pub fn loopback_devices(mut self, enable: bool) -> Self {
        self.loopback_devices = enable;
        self
    }

    /// Severe-underrun threshold in frames.
    pub fn severe_underrun_frames(mut self, frames: u32) -> Self {
        self.severe_underrun_frames = frames;
        self
    }

    /// Real-time priority for the engine thread, `None` to stay normal.
    pub fn rt_priority(mut self, priority: Option<i32>) -> Self {
        self.rt_priority = priority;
        self
    }

    pub fn build(self) -> Result<Server> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("empty socket path".into()));
        }
        if self.severe_underrun_frames == 0 {
            return Err(Error::InvalidConfig(
                "severe_underrun_frames must be non-zero".into(),
            ));
        }
        Server::new(ServerOptions {
            socket_path: self.socket_path,
            capture_socket_path: self.capture_socket_path,
            config_dir: self.config_dir,
            loopback_devices: self.loopback_devices,
            engine: EngineConfig {
                severe_underrun_frames: self.severe_underrun_frames,
                rt_priority: self.rt_priority,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            ServerBuilder::default().socket_path("").build(),
            Err(Error::InvalidConfig(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ServerBuilder::default()
                .socket_path(dir.path().join("concerto.sock"))
                .severe_underrun_frames(0)
                .build(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_build_binds_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concerto.sock");
        let server = ServerBuilder::default()
            .socket_path(&path)
            .rt_priority(None)
            .build()
            .unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }
}
