//! Per-peer TCP transport for the vela overlay network.
//!
//! This crate implements the transport layer a vela node uses to talk to one
//! remote node: a bidirectional, length-prefixed, framed message channel over
//! a single TCP connection. It provides:
//!
//! - **Framing** - A 4-byte length prefix with a reserved continuation bit,
//!   decoded with bounded allocation and size limits that tighten before the
//!   handshake completes
//! - **Ordered sends** - A FIFO write queue feeding a single in-flight write,
//!   with per-message queue and write latency instrumentation
//! - **Fair reads** - A receive path that drains already-buffered frames
//!   before returning to the scheduler, bounded by a yield budget
//! - **Graceful teardown** - A two-step shutdown (FIN, then close) that
//!   coexists with in-flight reads and writes and can wait for the write
//!   queue to drain
//!
//! # Architecture
//!
//! The crate is organized around these key components:
//!
//! - [`TcpPeer`] - One TCP connection to a remote node, created by
//!   [`TcpPeer::initiate`] (outbound) or [`TcpPeer::accept`] (inbound)
//! - [`PeerHub`] - The seam to the overlay manager: connection events,
//!   assembled messages, and peer removal flow through it
//! - [`MessageCodec`] - Length-prefixed framing over raw message bodies
//! - [`AuthenticatedEnvelope`] - The wire envelope carried inside each frame
//! - [`OverlayMetrics`] - Shared counters and latency timers for the
//!   transport
//!
//! The authentication handshake itself lives above this crate; the transport
//! only records its outcome via [`TcpPeer::mark_authenticated`], which raises
//! the inbound frame size limit from 4 KiB to 16 MiB.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vela_overlay::{
//!     Listener, OverlayConfig, OverlayMetrics, PeerAddress, PeerHub, TcpPeer,
//! };
//!
//! # async fn example(hub: Arc<dyn PeerHub>) -> vela_overlay::Result<()> {
//! let config = OverlayConfig::default();
//! let metrics = Arc::new(OverlayMetrics::new());
//!
//! // Dial out; the handle is live immediately, the dial completes in the
//! // background and the hub hears about it through `connected`.
//! let peer = TcpPeer::initiate(
//!     config.clone(),
//!     &hub,
//!     Arc::clone(&metrics),
//!     &PeerAddress::new("203.0.113.7", 7220),
//! )?;
//!
//! // Accept a connection and hand the socket to the transport.
//! let listener = Listener::bind(7220).await?;
//! let socket = listener.accept().await?;
//! let inbound = TcpPeer::accept(config, &hub, metrics, socket)?;
//! # let _ = (peer, inbound);
//! # Ok(())
//! # }
//! ```

mod codec;
mod error;
mod listener;
mod message;
mod metrics;
mod peer;

pub use codec::{MessageCodec, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_UNAUTH_MESSAGE_SIZE};
pub use error::OverlayError;
pub use listener::Listener;
pub use message::{
    decode_envelope, encode_envelope, helpers as message_helpers, Auth, AuthenticatedEnvelope,
    ErrorCode, ErrorMessage, Hello, NodeMessage,
};
pub use metrics::{Counter, OverlayMetrics, OverlayMetricsSnapshot, Timer, TimerSnapshot};
pub use peer::{ConnectionDirection, DropDirection, DropMode, PeerState, TcpPeer, BUFSZ};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Configuration for the per-peer transport.
///
/// Plain data; loading it from a file or the environment is the embedding
/// application's concern.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Maximum time to wait for an outbound TCP connect, in seconds.
    pub connect_timeout_secs: u64,

    /// Drop a peer after this long without read or write progress, in
    /// seconds.
    pub idle_timeout_secs: u64,

    /// Drop a peer whose write queue stays armed without draining for this
    /// long, in seconds. Catches remotes that read too slowly to keep up.
    pub straggler_timeout_secs: u64,

    /// Budget for one synchronous pass over buffered inbound frames, in
    /// milliseconds. Once spent, the read loop yields so other connections
    /// get a turn.
    pub yield_budget_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            idle_timeout_secs: 30,
            straggler_timeout_secs: 120,
            yield_budget_ms: 2,
        }
    }
}

/// Address of a peer on the network.
///
/// The host can be a hostname in general contexts, but outbound initiation
/// via [`TcpPeer::initiate`] requires an IPv4 literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// IP address or hostname of the peer.
    pub host: String,
    /// TCP port number.
    pub port: u16,
}

impl PeerAddress {
    /// Creates a new peer address from a host and port.
    ///
    /// # Example
    ///
    /// ```rust
    /// use vela_overlay::PeerAddress;
    ///
    /// let addr = PeerAddress::new("203.0.113.7", 7220);
    /// assert_eq!(addr.to_string(), "203.0.113.7:7220");
    /// ```
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The overlay manager's side of the transport.
///
/// A [`TcpPeer`] holds this seam weakly: the hub owns its peers, never the
/// other way around. Every callback runs on the peer's own tasks, so hub
/// implementations should hand heavy work off rather than block.
#[async_trait::async_trait]
pub trait PeerHub: Send + Sync {
    /// An outbound connection finished establishing.
    ///
    /// Fires before the first read is issued, so the hub can queue its
    /// opening handshake message here.
    async fn connected(&self, peer: &Arc<TcpPeer>);

    /// A fully assembled envelope arrived from the peer.
    ///
    /// Errors are logged by the transport; they do not terminate the
    /// connection.
    async fn recv_message(&self, peer: &Arc<TcpPeer>, envelope: AuthenticatedEnvelope)
        -> Result<()>;

    /// The peer is terminating and must leave the hub's registry.
    ///
    /// Invoked exactly once, from [`TcpPeer::drop_peer`].
    fn remove_peer(&self, peer: &TcpPeer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_address_display() {
        let addr = PeerAddress::new("127.0.0.1", 7220);
        assert_eq!(addr.to_string(), "127.0.0.1:7220");
    }

    #[test]
    fn default_config() {
        let config = OverlayConfig::default();
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.straggler_timeout_secs, 120);
        assert_eq!(config.yield_budget_ms, 2);
    }
}
