//! Error types for overlay transport operations.

use thiserror::Error;

/// Errors that can occur on a peer transport.
///
/// Covers connection establishment, framing, and wire-format failures. Most
/// transport-internal errors are terminal for the connection: the peer is
/// dropped rather than retried.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// TCP connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt timed out.
    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    /// The remote closed the connection.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// Framing or wire-format error (bad length prefix, oversize frame,
    /// envelope encode/decode failure).
    #[error("message error: {0}")]
    Message(String),

    /// Peer address is unusable (outbound initiation requires an IPv4
    /// literal).
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
