use std::net::SocketAddr;

/// All error types that can occur when talking to CozyLife devices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller supplied a command or data-point map that cannot be put on the wire.
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// A CRLF-terminated segment from a device could not be parsed.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// A command was issued while the device session was not connected.
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// A command was dispatched to a serial number with no session.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// The TCP connection to a device could not be established.
    #[error("failed to connect to {addr}: {err:?}")]
    ConnectFailure { addr: SocketAddr, err: std::io::Error },

    /// The device closed the TCP connection.
    #[error("connection to {0} closed by peer")]
    SocketClosed(SocketAddr),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: std::io::Error },

    /// The discovery listener could not be started.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The session was stopped and will not reconnect.
    #[error("session for {0} has been stopped")]
    SessionStopped(String),

    /// The device cannot perform the requested action in its current state.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An address or address range could not be parsed.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new connect failure error
    pub fn connect_failure(addr: SocketAddr, err: std::io::Error) -> Self {
        Error::ConnectFailure { addr, err }
    }

    /// Create a new not connected error
    pub fn not_connected(serial: &str) -> Self {
        Error::NotConnected(serial.to_string())
    }

    /// Create a new unknown device error
    pub fn unknown_device(serial: &str) -> Self {
        Error::UnknownDevice(serial.to_string())
    }
}

/// Compares errors by their message. Test-only since `io::Error` is not `PartialEq`.
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
