//! Error types for the remote server client.
//!
//! Every fallible operation on a [`Connection`](crate::client::Connection)
//! returns a [`ClientError`]. Protocol and remote errors abort only the call
//! in flight; the connection stays usable afterwards.

use thiserror::Error;

use crate::codec::CodecError;

/// Client-side error kinds.
///
/// These errors provide actionable messages for the failure modes of a
/// conversation with the remote server.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The reply did not follow the protocol (bad header byte, malformed
    /// value, or an unexpected number of results).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered `!E <message>`.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Failed to spawn or connect to the server, or it never answered the
    /// initial ping.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// I/O error on an established transport.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The connection was closed (or dropped) before the call.
    #[error("Connection is closed")]
    Closed,

    /// No remote object is registered under this id.
    #[error("No remote object with id {0}")]
    NotFound(u32),

    /// A function or method name that cannot be put in a request header.
    #[error("Invalid call name: {0:?}")]
    InvalidName(String),

    /// An endpoint string that is neither `host:port`, `tcp://` nor `unix://`.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionFailed(err)
            }
            _ => ClientError::Io(err),
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;
