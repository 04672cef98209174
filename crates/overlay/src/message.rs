//! Wire messages for the vela overlay.
//!
//! Every frame on an overlay connection carries one [`AuthenticatedEnvelope`]:
//! a sequence number, a [`NodeMessage`], and a MAC over both. The transport
//! treats the sequence and MAC as opaque; computing and verifying them is the
//! handshake layer's job. Envelopes are serialized with bincode.

use crate::{OverlayError, PeerAddress, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Error codes carried in [`ErrorMessage`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unspecific error.
    Misc,
    /// Malformed data (failed to deserialize).
    Data,
    /// Configuration mismatch between the two nodes.
    Config,
    /// Authentication failure.
    Auth,
    /// The node is shedding load.
    Load,
}

/// Last-gasp error notification sent before dropping a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Why the sender is disconnecting.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Opening handshake message carrying the node's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Ed25519 public key identifying the node.
    pub node_id: [u8; 32],
    /// Software version string.
    pub version: String,
    /// Port the node accepts inbound connections on.
    pub listening_port: u16,
    /// Random nonce mixed into key derivation.
    pub nonce: [u8; 32],
}

/// Handshake completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Reserved for protocol extensions; currently zero.
    pub flags: u32,
}

/// Messages exchanged between overlay nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Error notification, usually followed by disconnection.
    Error(ErrorMessage),
    /// Handshake: identity exchange.
    Hello(Hello),
    /// Handshake: completion.
    Auth(Auth),
    /// Request the peer's known addresses.
    GetPeers,
    /// Known addresses, in response to [`NodeMessage::GetPeers`].
    Peers(Vec<PeerAddress>),
    /// Application payload, flooded or routed by the layer above.
    Data(Vec<u8>),
}

/// The envelope carried inside every overlay frame.
///
/// `sequence` and `mac` protect against replay and tampering once the
/// handshake has established keys; during the handshake both are zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedEnvelope {
    /// Monotonic per-connection sequence number.
    pub sequence: u64,
    /// The message itself.
    pub message: NodeMessage,
    /// HMAC-SHA256 over sequence and message; all zeros before keys exist.
    pub mac: [u8; 32],
}

impl AuthenticatedEnvelope {
    /// Wraps a message with a zero sequence and MAC, for use before the
    /// handshake has established keys.
    pub fn unauthenticated(message: NodeMessage) -> Self {
        Self {
            sequence: 0,
            message,
            mac: [0u8; 32],
        }
    }
}

/// Serializes an envelope into the frame body format.
pub fn encode_envelope(envelope: &AuthenticatedEnvelope) -> Result<Bytes> {
    bincode::serialize(envelope)
        .map(Bytes::from)
        .map_err(|e| OverlayError::Message(format!("failed to encode envelope: {}", e)))
}

/// Deserializes a frame body into an envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<AuthenticatedEnvelope> {
    bincode::deserialize(bytes)
        .map_err(|e| OverlayError::Message(format!("failed to decode envelope: {}", e)))
}

/// Helper predicates for working with overlay messages.
pub mod helpers {
    use super::NodeMessage;

    /// Returns true for handshake messages (Hello or Auth).
    pub fn is_handshake_message(message: &NodeMessage) -> bool {
        matches!(message, NodeMessage::Hello(_) | NodeMessage::Auth(_))
    }

    /// Returns a short display name for the message type.
    pub fn message_type_name(message: &NodeMessage) -> &'static str {
        match message {
            NodeMessage::Error(_) => "ERROR",
            NodeMessage::Hello(_) => "HELLO",
            NodeMessage::Auth(_) => "AUTH",
            NodeMessage::GetPeers => "GET_PEERS",
            NodeMessage::Peers(_) => "PEERS",
            NodeMessage::Data(_) => "DATA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let envelope = AuthenticatedEnvelope {
            sequence: 42,
            message: NodeMessage::Data(vec![1, 2, 3]),
            mac: [9u8; 32],
        };

        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn hello_roundtrip() {
        let envelope = AuthenticatedEnvelope::unauthenticated(NodeMessage::Hello(Hello {
            node_id: [3u8; 32],
            version: "vela 0.1.0".to_string(),
            listening_port: 7220,
            nonce: [7u8; 32],
        }));

        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.sequence, 0);
        assert_eq!(decoded.mac, [0u8; 32]);
        assert!(helpers::is_handshake_message(&decoded.message));
    }

    #[test]
    fn corrupt_body_fails_to_decode() {
        assert!(decode_envelope(&[0xffu8; 16]).is_err());
        assert!(decode_envelope(&[]).is_err());
    }

    #[test]
    fn message_type_names() {
        assert_eq!(
            helpers::message_type_name(&NodeMessage::GetPeers),
            "GET_PEERS"
        );
        assert_eq!(
            helpers::message_type_name(&NodeMessage::Data(Vec::new())),
            "DATA"
        );
        assert!(!helpers::is_handshake_message(&NodeMessage::GetPeers));
    }
}
