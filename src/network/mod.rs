//! Network Layer
//!
//! Peer sessions, remote call routing and state replication on top of a
//! pluggable transport. WebSocket links for real play, an in-process hub for
//! tests and local demos.

pub mod protocol;
pub mod transport;
pub mod loopback;
pub mod ws;
pub mod rpc;
pub mod replication;
pub mod diagnostics;
pub mod session;

pub use protocol::{Delivery, Envelope, Frame, ProtocolError, RemoteCall, Target};
pub use transport::{Transport, TransportError, TransportEvent};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use ws::WsTransport;
pub use rpc::{AuthorityViolation, CallerRule, ReceiverRule, RpcPolicy, RpcTable};
pub use replication::{ApplyResult, ReplicationChannel, ReplicationConfig, ReplicationStats};
pub use diagnostics::{ScoreLine, SessionSnapshot};
pub use session::{
    canonical_address, ConnectionState, Peer, PeerRole, SessionConfig, SessionError, SessionId,
    SessionManager,
};
