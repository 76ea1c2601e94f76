use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur while bridging transports, sessions, and tunnels.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted on a stream after it was disposed
    #[error("stream has been disposed")]
    ObjectDisposed,

    /// Malformed or missing required input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport never reached the open state within the wait bound
    #[error("connection not established within {0:?}")]
    ConnectionTimeout(Duration),

    /// Underlying WebSocket transport failure
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// Transport closed abnormally, carrying the observed close code
    #[error("transport closed abnormally with code {code}: {reason}")]
    AbnormalClose { code: u16, reason: String },

    /// Stream closed by the local side without a specific error
    #[error("stream closed")]
    StreamClosed,

    /// SSH protocol error
    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Tunnel endpoint could not be bound
    #[error("failed to bind {address}: {source}")]
    TunnelBind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Forward request rejected by the remote side or the local policy
    #[error("forward to {host}:{port} denied")]
    TunnelDenied { host: String, port: u16 },

    /// Session-level authentication was not accepted
    #[error("authentication failed for {user}")]
    AuthenticationFailed { user: String },

    /// Monitored process terminated abnormally
    #[error("bridged process exited abnormally (code {code:?})")]
    ProcessExit { code: Option<i32> },

    /// Host key could not be loaded or generated
    #[error("host key error: {0}")]
    HostKey(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for warren operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a bind error for the given address
    pub fn bind(address: impl Into<String>, source: io::Error) -> Self {
        Self::TunnelBind {
            address: address.into(),
            source,
        }
    }

    /// Create a denial error for the given endpoint
    pub fn denied(host: impl Into<String>, port: u16) -> Self {
        Self::TunnelDenied {
            host: host.into(),
            port,
        }
    }
}
