//! Transport Contract
//!
//! The session core never touches sockets. A transport delivers frames to
//! named peers and queues connection events until the next `poll`.

use crate::game::entity::PeerId;
use crate::network::protocol::{Delivery, Envelope, Frame};

/// Something that happened on the wire since the last poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peer link came up. On a client this is the host.
    PeerConnected(PeerId),
    /// A peer link went down.
    PeerDisconnected(PeerId),
    /// A routed call arrived over the link to `from`.
    Message {
        /// Link the frame arrived on.
        from: PeerId,
        /// The call.
        envelope: Envelope,
    },
}

/// Bind/connect/send failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Listening port already taken.
    #[error("address in use: port {0}")]
    AddressInUse(u16),

    /// Nothing listening at the address.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// Handshake did not complete in time.
    #[error("connection timed out: {0}")]
    Timeout(String),

    /// Host refused the connection (full).
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// No link to that peer, or transport closed.
    #[error("not connected to peer {0}")]
    NotConnected(PeerId),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(String),

    /// Malformed handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A peer-addressed datagram transport.
pub trait Transport {
    /// Start accepting up to `max_peers` clients on `port`.
    fn listen(&mut self, port: u16, max_peers: usize) -> Result<(), TransportError>;

    /// Connect to a host. Returns the id the host assigned to us.
    fn connect(&mut self, address: &str, port: u16) -> Result<PeerId, TransportError>;

    /// Send a frame over the link to `to`.
    fn send(&mut self, to: PeerId, frame: &Frame, delivery: Delivery) -> Result<(), TransportError>;

    /// Drain everything received since the last poll.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Tear down all links. Idempotent.
    fn close(&mut self);
}
