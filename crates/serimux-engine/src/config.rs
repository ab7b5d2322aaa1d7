use std::path::PathBuf;
use std::time::Duration;

use serimux_transport::UnixDomainSocket;

/// Serial transport opened when nothing else is configured.
pub const DEFAULT_TRANSPORT: &str = "/dev/qemud";

/// Client socket bound when nothing else is configured.
pub const DEFAULT_SOCKET: &str = "/dev/socket/qemud";

/// Where client connections come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    /// Bind a fresh socket at this path.
    Path(PathBuf),
    /// Adopt a listening socket passed by the parent under this name.
    Inherited(String),
}

/// Configuration for building a [`crate::Multiplexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub transport: PathBuf,
    pub listen: ListenEndpoint,
    /// Permission bits applied to a bound client socket.
    pub socket_mode: u32,
    /// Upper bound on a single reactor wait. `None` waits indefinitely.
    pub poll_interval: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            transport: PathBuf::from(DEFAULT_TRANSPORT),
            listen: ListenEndpoint::Path(PathBuf::from(DEFAULT_SOCKET)),
            socket_mode: UnixDomainSocket::DEFAULT_SOCKET_MODE,
            poll_interval: None,
        }
    }
}
