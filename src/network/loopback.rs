//! In-Process Loopback Transport
//!
//! A shared hub that routes encoded frames between endpoints in the same
//! process. Frames go through the real bincode codec so the wire format is
//! exercised without sockets.
//!
//! ## Layout
//!
//! ```text
//! LoopbackNetwork (Arc<Mutex<Hub>>)
//!   ├── listeners: port → { host endpoint, clients: PeerId → endpoint }
//!   └── inboxes:   endpoint → queue of pending events
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::game::entity::PeerId;
use crate::network::protocol::{Delivery, Frame};
use crate::network::transport::{Transport, TransportError, TransportEvent};

type EndpointId = u64;

#[derive(Debug)]
enum Inbound {
    Connected(PeerId),
    Disconnected(PeerId),
    Data { from: PeerId, bytes: Vec<u8> },
}

#[derive(Debug)]
struct Listener {
    endpoint: EndpointId,
    max_peers: usize,
    next_id: u32,
    clients: BTreeMap<PeerId, EndpointId>,
}

#[derive(Debug, Default)]
struct Hub {
    next_endpoint: EndpointId,
    listeners: BTreeMap<u16, Listener>,
    inboxes: BTreeMap<EndpointId, VecDeque<Inbound>>,
    /// Drop every Nth unreliable frame (0 = never).
    drop_unreliable_every: u64,
    unreliable_seen: u64,
}

impl Hub {
    fn push(&mut self, endpoint: EndpointId, event: Inbound) {
        if let Some(inbox) = self.inboxes.get_mut(&endpoint) {
            inbox.push_back(event);
        }
    }

    fn should_drop(&mut self, delivery: Delivery) -> bool {
        if delivery == Delivery::Reliable || self.drop_unreliable_every == 0 {
            return false;
        }
        self.unreliable_seen += 1;
        self.unreliable_seen % self.drop_unreliable_every == 0
    }
}

/// Shared in-process network. Clone it to hand out endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new unbound endpoint.
    pub fn endpoint(&self) -> LoopbackTransport {
        let id = {
            let mut hub = self.lock();
            hub.next_endpoint += 1;
            let id = hub.next_endpoint;
            hub.inboxes.insert(id, VecDeque::new());
            id
        };
        LoopbackTransport {
            network: self.clone(),
            endpoint: id,
            link: Link::Unbound,
        }
    }

    /// Drop every `n`th unreliable frame. `0` disables loss.
    pub fn set_unreliable_loss(&self, n: u64) {
        self.lock().drop_unreliable_every = n;
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        // A poisoned hub only means another test thread panicked; keep going.
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Link {
    Unbound,
    Listening { port: u16 },
    Connected { port: u16, local: PeerId },
}

/// One endpoint on a `LoopbackNetwork`.
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    endpoint: EndpointId,
    link: Link,
}

impl LoopbackTransport {
    /// Check if the endpoint is hosting or connected.
    pub fn is_open(&self) -> bool {
        self.link != Link::Unbound
    }
}

impl Transport for LoopbackTransport {
    fn listen(&mut self, port: u16, max_peers: usize) -> Result<(), TransportError> {
        let mut hub = self.network.lock();
        if hub.listeners.contains_key(&port) {
            return Err(TransportError::AddressInUse(port));
        }
        hub.listeners.insert(port, Listener {
            endpoint: self.endpoint,
            max_peers,
            next_id: PeerId::FIRST_CLIENT.0,
            clients: BTreeMap::new(),
        });
        self.link = Link::Listening { port };
        debug!("Loopback endpoint {} listening on {}", self.endpoint, port);
        Ok(())
    }

    fn connect(&mut self, address: &str, port: u16) -> Result<PeerId, TransportError> {
        let mut hub = self.network.lock();
        let endpoint = self.endpoint;

        let listener = hub
            .listeners
            .get_mut(&port)
            .ok_or_else(|| TransportError::Unreachable(format!("{}:{}", address, port)))?;

        if listener.clients.len() >= listener.max_peers {
            return Err(TransportError::Rejected(format!("host on port {} is full", port)));
        }

        let local = PeerId(listener.next_id);
        listener.next_id += 1;
        listener.clients.insert(local, endpoint);
        let host_endpoint = listener.endpoint;

        hub.push(host_endpoint, Inbound::Connected(local));
        hub.push(endpoint, Inbound::Connected(PeerId::HOST));

        self.link = Link::Connected { port, local };
        debug!("Loopback endpoint {} joined port {} as {}", endpoint, port, local);
        Ok(local)
    }

    fn send(&mut self, to: PeerId, frame: &Frame, delivery: Delivery) -> Result<(), TransportError> {
        let bytes = frame
            .to_bytes()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut hub = self.network.lock();

        let (dest, from) = match self.link {
            Link::Listening { port } => {
                let dest = hub
                    .listeners
                    .get(&port)
                    .and_then(|l| l.clients.get(&to).copied())
                    .ok_or(TransportError::NotConnected(to))?;
                (dest, PeerId::HOST)
            }
            Link::Connected { port, local } => {
                if to != PeerId::HOST {
                    return Err(TransportError::NotConnected(to));
                }
                let dest = hub
                    .listeners
                    .get(&port)
                    .filter(|l| l.clients.contains_key(&local))
                    .map(|l| l.endpoint)
                    .ok_or(TransportError::NotConnected(to))?;
                (dest, local)
            }
            Link::Unbound => return Err(TransportError::NotConnected(to)),
        };

        if hub.should_drop(delivery) {
            return Ok(());
        }
        hub.push(dest, Inbound::Data { from, bytes });
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let drained: Vec<Inbound> = {
            let mut hub = self.network.lock();
            match hub.inboxes.get_mut(&self.endpoint) {
                Some(inbox) => inbox.drain(..).collect(),
                None => Vec::new(),
            }
        };

        let mut events = Vec::with_capacity(drained.len());
        for inbound in drained {
            match inbound {
                Inbound::Connected(peer) => events.push(TransportEvent::PeerConnected(peer)),
                Inbound::Disconnected(peer) => {
                    if self.link_lost(peer) {
                        self.link = Link::Unbound;
                    }
                    events.push(TransportEvent::PeerDisconnected(peer));
                }
                Inbound::Data { from, bytes } => match Frame::from_bytes(&bytes) {
                    Ok(Frame::Call(envelope)) => events.push(TransportEvent::Message { from, envelope }),
                    Ok(Frame::Welcome { .. }) => debug!("Ignoring welcome frame on loopback"),
                    Err(e) => warn!("Dropping undecodable frame from {}: {}", from, e),
                },
            }
        }
        events
    }

    fn close(&mut self) {
        let mut hub = self.network.lock();

        match self.link {
            Link::Listening { port } => {
                if let Some(listener) = hub.listeners.remove(&port) {
                    for endpoint in listener.clients.values() {
                        hub.push(*endpoint, Inbound::Disconnected(PeerId::HOST));
                    }
                }
            }
            Link::Connected { port, local } => {
                let host = hub.listeners.get_mut(&port).and_then(|l| {
                    l.clients.remove(&local).map(|_| l.endpoint)
                });
                if let Some(host) = host {
                    hub.push(host, Inbound::Disconnected(local));
                }
            }
            Link::Unbound => {}
        }

        if let Some(inbox) = hub.inboxes.get_mut(&self.endpoint) {
            inbox.clear();
        }
        self.link = Link::Unbound;
    }
}

impl LoopbackTransport {
    fn link_lost(&self, peer: PeerId) -> bool {
        matches!(self.link, Link::Connected { .. }) && peer == PeerId::HOST
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
        self.network.lock().inboxes.remove(&self.endpoint);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{Envelope, RemoteCall, Target};

    fn call(origin: PeerId) -> Frame {
        Frame::Call(Envelope::new(origin, Target::All, RemoteCall::AddKill { attacker: origin }))
    }

    #[test]
    fn test_listen_twice_fails() {
        let net = LoopbackNetwork::new();
        let mut a = net.endpoint();
        let mut b = net.endpoint();
        a.listen(28960, 4).unwrap();
        assert_eq!(b.listen(28960, 4), Err(TransportError::AddressInUse(28960)));
    }

    #[test]
    fn test_connect_assigns_ids_from_two() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint();
        host.listen(7000, 4).unwrap();

        let mut c1 = net.endpoint();
        let mut c2 = net.endpoint();
        assert_eq!(c1.connect("127.0.0.1", 7000).unwrap(), PeerId(2));
        assert_eq!(c2.connect("127.0.0.1", 7000).unwrap(), PeerId(3));

        assert_eq!(
            host.poll(),
            vec![TransportEvent::PeerConnected(PeerId(2)), TransportEvent::PeerConnected(PeerId(3))]
        );
        assert_eq!(c1.poll(), vec![TransportEvent::PeerConnected(PeerId::HOST)]);
    }

    #[test]
    fn test_unreachable_and_full() {
        let net = LoopbackNetwork::new();
        let mut c = net.endpoint();
        assert!(matches!(c.connect("127.0.0.1", 1), Err(TransportError::Unreachable(_))));

        let mut host = net.endpoint();
        host.listen(7001, 1).unwrap();
        c.connect("127.0.0.1", 7001).unwrap();
        let mut late = net.endpoint();
        assert!(matches!(late.connect("127.0.0.1", 7001), Err(TransportError::Rejected(_))));
    }

    #[test]
    fn test_frames_routed_both_ways() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint();
        host.listen(7002, 4).unwrap();
        let mut client = net.endpoint();
        let id = client.connect("127.0.0.1", 7002).unwrap();
        host.poll();
        client.poll();

        client.send(PeerId::HOST, &call(id), Delivery::Reliable).unwrap();
        let events = host.poll();
        assert!(matches!(&events[..], [TransportEvent::Message { from, .. }] if *from == id));

        host.send(id, &call(PeerId::HOST), Delivery::Reliable).unwrap();
        assert_eq!(client.poll().len(), 1);

        // Clients only talk to the host
        assert_eq!(
            client.send(PeerId(9), &call(id), Delivery::Reliable),
            Err(TransportError::NotConnected(PeerId(9)))
        );
    }

    #[test]
    fn test_host_close_notifies_clients() {
        let net = LoopbackNetwork::new();
        let mut host = net.endpoint();
        host.listen(7003, 4).unwrap();
        let mut client = net.endpoint();
        client.connect("127.0.0.1", 7003).unwrap();
        client.poll();

        host.close();
        host.close();
        assert_eq!(client.poll(), vec![TransportEvent::PeerDisconnected(PeerId::HOST)]);
        assert!(!client.is_open());

        // Port is free again
        let mut again = net.endpoint();
        assert!(again.listen(7003, 4).is_ok());
    }

    #[test]
    fn test_unreliable_loss() {
        let net = LoopbackNetwork::new();
        net.set_unreliable_loss(2);
        let mut host = net.endpoint();
        host.listen(7004, 4).unwrap();
        let mut client = net.endpoint();
        let id = client.connect("127.0.0.1", 7004).unwrap();
        host.poll();

        for _ in 0..4 {
            client.send(PeerId::HOST, &call(id), Delivery::Unreliable).unwrap();
        }
        client.send(PeerId::HOST, &call(id), Delivery::Reliable).unwrap();
        assert_eq!(host.poll().len(), 3);
    }
}
