//! WebSocket Transport
//!
//! Async WebSocket links driven by a private tokio runtime, exposed through
//! the synchronous `Transport` contract. I/O tasks never touch session
//! state: they push `TransportEvent`s into a channel that `poll` drains.
//!
//! ## Tasks
//!
//! ```text
//! host:   accept loop ──► per-client { writer task, reader loop }
//! client: handshake (Welcome) ──► { writer task, reader loop }
//! all tasks stop on the shutdown broadcast
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::game::entity::PeerId;
use crate::network::protocol::{Delivery, Frame};
use crate::network::transport::{Transport, TransportError, TransportEvent};

/// Per-link outgoing queue depth.
const LINK_QUEUE: usize = 256;

type Links = Arc<RwLock<BTreeMap<PeerId, mpsc::Sender<Vec<u8>>>>>;

/// WebSocket implementation of `Transport`.
pub struct WsTransport {
    runtime: Runtime,
    connect_timeout: Duration,
    links: Links,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: Option<SocketAddr>,
}

impl WsTransport {
    /// Create a transport with its own runtime.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("skirmish-ws")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            runtime,
            connect_timeout,
            links: Arc::new(RwLock::new(BTreeMap::new())),
            events_tx,
            events_rx,
            shutdown_tx,
            local_addr: None,
        })
    }

    /// Port actually bound (useful after listening on port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|a| a.port())
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.links.blocking_read().len()
    }
}

impl Transport for WsTransport {
    fn listen(&mut self, port: u16, max_peers: usize) -> Result<(), TransportError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = self
            .runtime
            .block_on(TcpListener::bind(addr))
            .map_err(|e| match e.kind() {
                ErrorKind::AddrInUse => TransportError::AddressInUse(port),
                _ => TransportError::Io(e.to_string()),
            })?;

        self.local_addr = listener.local_addr().ok();
        info!("WebSocket host listening on {:?}", self.local_addr);

        let links = self.links.clone();
        let events = self.events_tx.clone();
        let shutdown = self.shutdown_tx.clone();
        self.runtime.spawn(run_accept_loop(listener, max_peers, links, events, shutdown));
        Ok(())
    }

    fn connect(&mut self, address: &str, port: u16) -> Result<PeerId, TransportError> {
        let url = format!("ws://{}:{}", address, port);
        let timeout = self.connect_timeout;

        // The timer must be created inside the runtime
        let handshake = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, client_handshake(&url)).await });
        let (local, ws) = handshake.map_err(|_| TransportError::Timeout(url.clone()))??;

        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        let links = self.links.clone();
        self.runtime.block_on(async {
            links.write().await.insert(PeerId::HOST, tx);
        });
        let _ = self.events_tx.send(TransportEvent::PeerConnected(PeerId::HOST));

        let events = self.events_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.runtime.spawn(run_link(ws, PeerId::HOST, rx, links, events, shutdown));

        info!("Connected to {} as {}", url, local);
        Ok(local)
    }

    fn send(&mut self, to: PeerId, frame: &Frame, delivery: Delivery) -> Result<(), TransportError> {
        let bytes = frame
            .to_bytes()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let links = self.links.blocking_read();
        let link = links.get(&to).ok_or(TransportError::NotConnected(to))?;

        match link.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if delivery == Delivery::Reliable {
                    warn!("Outgoing queue full for peer {}, dropping reliable frame", to);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotConnected(to)),
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn close(&mut self) {
        debug!("Closing WebSocket transport ({} links)", self.link_count());
        let _ = self.shutdown_tx.send(());
        self.links.blocking_write().clear();
        self.local_addr = None;

        // Fresh channels so events from dying tasks never reach a later session.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = events_tx;
        self.events_rx = events_rx;
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = shutdown_tx;
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

// =============================================================================
// TASKS
// =============================================================================

async fn run_accept_loop(
    listener: TcpListener,
    max_peers: usize,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut next_id = PeerId::FIRST_CLIENT.0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let peer = PeerId(next_id);
                        next_id += 1;
                        debug!("New connection from {} (peer {})", addr, peer);
                        tokio::spawn(serve_client(
                            stream,
                            addr,
                            peer,
                            max_peers,
                            links.clone(),
                            events.clone(),
                            shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    peer: PeerId,
    max_peers: usize,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: broadcast::Receiver<()>,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    // Check and reserve the slot under one write lock
    let (tx, rx) = mpsc::channel(LINK_QUEUE);
    {
        let mut table = links.write().await;
        if table.len() >= max_peers {
            drop(table);
            warn!("Host full, rejecting {}", addr);
            let _ = ws.close(None).await;
            return;
        }
        table.insert(peer, tx);
    }

    let welcome = match (Frame::Welcome { peer_id: peer }).to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode welcome: {}", e);
            links.write().await.remove(&peer);
            return;
        }
    };
    if ws.send(Message::Binary(welcome)).await.is_err() {
        links.write().await.remove(&peer);
        return;
    }

    let _ = events.send(TransportEvent::PeerConnected(peer));
    info!("Peer {} connected from {}", peer, addr);

    run_link(ws, peer, rx, links, events, shutdown).await;
}

async fn client_handshake(url: &str) -> Result<(PeerId, WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>), TransportError> {
    let (mut ws, _) = connect_async(url).await.map_err(|e| match e {
        tungstenite::Error::Io(io) if io.kind() == ErrorKind::ConnectionRefused => {
            TransportError::Unreachable(url.to_string())
        }
        tungstenite::Error::Io(io) => TransportError::Io(io.to_string()),
        other => TransportError::Handshake(other.to_string()),
    })?;

    match ws.next().await {
        Some(Ok(Message::Binary(data))) => match Frame::from_bytes(&data) {
            Ok(Frame::Welcome { peer_id }) => Ok((peer_id, ws)),
            Ok(other) => Err(TransportError::Handshake(format!("expected welcome, got {:?}", other))),
            Err(e) => Err(TransportError::Handshake(e.to_string())),
        },
        Some(Ok(Message::Close(_))) | None => Err(TransportError::Rejected(url.to_string())),
        Some(Ok(other)) => Err(TransportError::Handshake(format!("unexpected message {:?}", other))),
        Some(Err(e)) => Err(TransportError::Handshake(e.to_string())),
    }
}

/// Pump one established link until it closes or shutdown fires.
async fn run_link<S>(
    ws: WebSocketStream<S>,
    peer: PeerId,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let sender_task = tokio::spawn(async move {
        while let Some(bytes) = outgoing.recv().await {
            if ws_sender.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match Frame::from_bytes(&data) {
                        Ok(Frame::Call(envelope)) => {
                            #[cfg(feature = "debug-tracing")]
                            tracing::trace!("{} from {}", envelope.call.name(), peer);
                            let _ = events.send(TransportEvent::Message { from: peer, envelope });
                        }
                        Ok(Frame::Welcome { .. }) => debug!("Unexpected welcome from {}", peer),
                        Err(e) => debug!("Invalid frame from {}: {}", peer, e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Peer {} closed the link", peer);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for peer {}: {}", peer, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }

    sender_task.abort();
    links.write().await.remove(&peer);
    let _ = events.send(TransportEvent::PeerDisconnected(peer));
    info!("Peer {} link closed", peer);
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{Envelope, RemoteCall, Target};
    use std::time::Instant;

    fn wait_for(transport: &mut WsTransport, pred: impl Fn(&TransportEvent) -> bool) -> Option<TransportEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(ev) = transport.poll().into_iter().find(|e| pred(e)) {
                return Some(ev);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn test_ws_connect_and_exchange() {
        let mut host = WsTransport::new(Duration::from_secs(5)).unwrap();
        host.listen(0, 4).unwrap();
        let port = host.local_port().unwrap();

        let mut client = WsTransport::new(Duration::from_secs(5)).unwrap();
        let id = client.connect("127.0.0.1", port).unwrap();
        assert_eq!(id, PeerId(2));

        let connected = wait_for(&mut host, |e| matches!(e, TransportEvent::PeerConnected(_)));
        assert_eq!(connected, Some(TransportEvent::PeerConnected(PeerId(2))));

        let frame = Frame::Call(Envelope::new(id, Target::Host, RemoteCall::AddKill { attacker: id }));
        client.send(PeerId::HOST, &frame, Delivery::Reliable).unwrap();

        let received = wait_for(&mut host, |e| matches!(e, TransportEvent::Message { .. }));
        match received {
            Some(TransportEvent::Message { from, envelope }) => {
                assert_eq!(from, id);
                assert_eq!(envelope.call, RemoteCall::AddKill { attacker: id });
            }
            other => panic!("expected message, got {:?}", other),
        }

        host.close();
        let lost = wait_for(&mut client, |e| matches!(e, TransportEvent::PeerDisconnected(_)));
        assert_eq!(lost, Some(TransportEvent::PeerDisconnected(PeerId::HOST)));
    }

    #[test]
    fn test_ws_connect_refused() {
        // Grab a free port, then release it
        let port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };

        let mut client = WsTransport::new(Duration::from_secs(2)).unwrap();
        let result = client.connect("127.0.0.1", port);
        assert!(matches!(result, Err(TransportError::Unreachable(_))), "{:?}", result);
    }

    #[test]
    fn test_ws_connect_timeout() {
        // Accepts TCP but never answers the WebSocket upgrade
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let mut client = WsTransport::new(Duration::from_millis(300)).unwrap();
        let result = client.connect("127.0.0.1", port);
        assert!(matches!(result, Err(TransportError::Timeout(_))), "{:?}", result);
        drop(silent);
    }

    #[test]
    fn test_ws_full_host_admits_one_of_simultaneous_joins() {
        let mut host = WsTransport::new(Duration::from_secs(5)).unwrap();
        host.listen(0, 1).unwrap();
        let port = host.local_port().unwrap();

        let joins: Vec<_> = (0..2)
            .map(|_| {
                std::thread::spawn(move || {
                    let mut client = WsTransport::new(Duration::from_secs(5)).unwrap();
                    let result = client.connect("127.0.0.1", port);
                    (result, client)
                })
            })
            .collect();
        let results: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();

        let admitted = results.iter().filter(|(r, _)| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(results
            .iter()
            .any(|(r, _)| matches!(r, Err(TransportError::Rejected(_)))));

        wait_for(&mut host, |e| matches!(e, TransportEvent::PeerConnected(_)));
        assert_eq!(host.link_count(), 1);
    }

    #[test]
    fn test_ws_address_in_use() {
        let mut a = WsTransport::new(Duration::from_secs(1)).unwrap();
        a.listen(0, 4).unwrap();
        let port = a.local_port().unwrap();

        let mut b = WsTransport::new(Duration::from_secs(1)).unwrap();
        assert_eq!(b.listen(port, 4), Err(TransportError::AddressInUse(port)));
    }

    #[test]
    fn test_ws_send_without_link() {
        let mut t = WsTransport::new(Duration::from_secs(1)).unwrap();
        let frame = Frame::Welcome { peer_id: PeerId(2) };
        assert_eq!(
            t.send(PeerId(2), &frame, Delivery::Reliable),
            Err(TransportError::NotConnected(PeerId(2)))
        );
        t.close();
        t.close();
    }
}
