//! Error types for the link.

use crate::domain::commands::CommandError;
use crate::domain::models::RemoteDevice;
use thiserror::Error;

/// Failures surfaced by the link layer.
///
/// None of these are fatal to the process; the connection manager stays
/// usable after any of them.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Socket create/accept/read failure.
    #[error("socket error during {op}: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the stream or the socket was released.
    #[error("connection closed")]
    ConnectionClosed,

    /// An outbound connection attempt did not succeed.
    #[error("connect to {device} failed: {reason}")]
    ConnectFailed { device: RemoteDevice, reason: String },

    /// Write on a session that is closed or whose socket failed.
    #[error("write failed: {0}")]
    Write(String),

    /// Write with no session open.
    #[error("no active session")]
    NoActiveSession,

    #[error(transparent)]
    InvalidCommand(#[from] CommandError),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection manager task has shut down.
    #[error("connection manager stopped")]
    ManagerStopped,
}

impl LinkError {
    pub fn socket(op: &'static str, source: std::io::Error) -> Self {
        Self::Socket { op, source }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
