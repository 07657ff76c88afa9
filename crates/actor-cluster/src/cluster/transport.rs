//! # Transports
//!
//! The association layer only needs ordered, message-framed, bidirectional channels. A
//! [`Transport`] produces them by dialing a [`Node`] or by accepting on a bound listener.
//!
//! - [`TcpTransport`]: one TCP stream per channel, 4-byte big-endian length prefix per message.
//! - [`LocalNetwork`]: an in-process hub for tests. Every channel runs through relay tasks, so a
//!   node can be cut off ([`LocalNetwork::isolate`]) without the peer being told anything.
//!
//! A channel is closed by dropping its sender; the peer then sees its receiver end.

use crate::error::{AssociationError, FrameworkError};
use crate::identity::Node;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Largest message accepted from the network.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CHANNEL_BUFFER: usize = 1024;

/// One end of a connection.
#[derive(Debug)]
pub struct Channel {
    pub tx: mpsc::Sender<Bytes>,
    pub rx: mpsc::Receiver<Bytes>,
}

impl Channel {
    /// Two connected ends.
    pub fn pair(buffer: usize) -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (
            Channel { tx: a_tx, rx: a_rx },
            Channel { tx: b_tx, rx: b_rx },
        )
    }
}

#[async_trait]
pub trait Listener: Send {
    /// The next inbound channel, `None` once the listener is closed.
    async fn accept(&mut self) -> Option<Channel>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn bind(&self, node: &Node) -> Result<Box<dyn Listener>, FrameworkError>;

    async fn connect(&self, node: &Node) -> Result<Channel, AssociationError>;
}

// =============================================================================
// TCP
// =============================================================================

/// Plain TCP with length-prefixed framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    fn spawn_channel(stream: TcpStream, peer: String) -> Channel {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_BUFFER);
        tokio::spawn(Self::writer_task(write_half, outbound_rx, peer.clone()));
        tokio::spawn(Self::reader_task(read_half, inbound_tx, peer));
        Channel {
            tx: outbound_tx,
            rx: inbound_rx,
        }
    }

    async fn writer_task(
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Bytes>,
        peer: String,
    ) {
        while let Some(frame) = rx.recv().await {
            let len = frame.len() as u32;
            if let Err(e) = write_half.write_all(&len.to_be_bytes()).await {
                debug!(peer = %peer, error = %e, "Failed to write length");
                break;
            }
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(peer = %peer, error = %e, "Failed to write payload");
                break;
            }
        }
        let _ = write_half.shutdown().await;
        debug!(peer = %peer, "Writer task exiting");
    }

    async fn reader_task(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Bytes>, peer: String) {
        loop {
            let mut len_bytes = [0u8; 4];
            if let Err(e) = read_half.read_exact(&mut len_bytes).await {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!(peer = %peer, error = %e, "Failed to read length");
                }
                break;
            }
            let len = u32::from_be_bytes(len_bytes) as usize;
            if len > MAX_FRAME_BYTES {
                warn!(peer = %peer, len, "Frame too large, closing connection");
                break;
            }
            let mut buffer = vec![0u8; len];
            if let Err(e) = read_half.read_exact(&mut buffer).await {
                debug!(peer = %peer, error = %e, "Failed to read payload");
                break;
            }
            if tx.send(Bytes::from(buffer)).await.is_err() {
                break;
            }
        }
        debug!(peer = %peer, "Reader task exiting");
    }
}

struct TcpChannelListener {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpChannelListener {
    async fn accept(&mut self) -> Option<Channel> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    return Some(TcpTransport::spawn_channel(stream, peer.to_string()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    if e.kind() != std::io::ErrorKind::ConnectionAborted {
                        return None;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self, node: &Node) -> Result<Box<dyn Listener>, FrameworkError> {
        let listener = TcpListener::bind(node.address()).await?;
        Ok(Box::new(TcpChannelListener { listener }))
    }

    async fn connect(&self, node: &Node) -> Result<Channel, AssociationError> {
        let stream =
            TcpStream::connect(node.address())
                .await
                .map_err(|e| AssociationError::ConnectFailed {
                    node: node.clone(),
                    reason: e.to_string(),
                })?;
        Ok(Self::spawn_channel(stream, node.address()))
    }
}

// =============================================================================
// In-memory network
// =============================================================================

struct Link {
    a: Node,
    b: Node,
    kill: watch::Sender<bool>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<Node, mpsc::UnboundedSender<Channel>>,
    isolated: HashSet<Node>,
    links: Vec<Link>,
}

/// In-process network shared by every node of a test cluster.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport a node bound at `local` uses.
    pub fn transport_for(&self, local: &Node) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            local: local.clone(),
        })
    }

    /// Cuts every link of `node` and refuses new ones until [`heal`](Self::heal). Peers only see
    /// closed channels.
    pub fn isolate(&self, node: &Node) {
        let mut state = self.state();
        state.isolated.insert(node.clone());
        state.links.retain(|link| {
            let touches = &link.a == node || &link.b == node;
            if touches {
                let _ = link.kill.send(true);
            }
            !touches
        });
    }

    pub fn heal(&self, node: &Node) {
        self.state().isolated.remove(node);
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self, from: &Node, to: &Node) -> Result<Channel, AssociationError> {
        let refused = |reason: &str| AssociationError::ConnectFailed {
            node: to.clone(),
            reason: reason.to_string(),
        };
        let mut state = self.state();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(refused("unreachable"));
        }
        let listener = state
            .listeners
            .get(to)
            .cloned()
            .ok_or_else(|| refused("connection refused"))?;

        let (client, client_inner) = Channel::pair(CHANNEL_BUFFER);
        let (server_inner, server) = Channel::pair(CHANNEL_BUFFER);
        let (kill, _) = watch::channel(false);
        tokio::spawn(relay(client_inner.rx, server_inner.tx, kill.subscribe()));
        tokio::spawn(relay(server_inner.rx, client_inner.tx, kill.subscribe()));

        listener
            .send(server)
            .map_err(|_| refused("connection refused"))?;
        state.links.retain(|link| !link.kill.is_closed());
        state.links.push(Link {
            a: from.clone(),
            b: to.clone(),
            kill,
        });
        Ok(client)
    }
}

async fn relay(
    mut from: mpsc::Receiver<Bytes>,
    to: mpsc::Sender<Bytes>,
    mut kill: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = async { kill.wait_for(|killed| *killed).await.map(|_| ()) } => break,
            frame = from.recv() => match frame {
                Some(frame) => {
                    if to.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

struct LocalTransport {
    network: LocalNetwork,
    local: Node,
}

struct LocalListener {
    rx: mpsc::UnboundedReceiver<Channel>,
}

#[async_trait]
impl Listener for LocalListener {
    async fn accept(&mut self) -> Option<Channel> {
        self.rx.recv().await
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn bind(&self, node: &Node) -> Result<Box<dyn Listener>, FrameworkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.network.state();
        if state
            .listeners
            .get(node)
            .is_some_and(|existing| !existing.is_closed())
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{} is already bound", node.address()),
            )
            .into());
        }
        state.listeners.insert(node.clone(), tx);
        Ok(Box::new(LocalListener { rx }))
    }

    async fn connect(&self, node: &Node) -> Result<Channel, AssociationError> {
        self.network.connect(&self.local, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_network_round_trip() {
        let network = LocalNetwork::new();
        let a = Node::new("a", "local", 1);
        let b = Node::new("b", "local", 2);
        let mut listener = network.transport_for(&b).bind(&b).await.unwrap();

        let mut client = network.transport_for(&a).connect(&b).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.tx.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(server.rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
        server.tx.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(client.rx.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_connect_to_unbound_node_fails() {
        let network = LocalNetwork::new();
        let a = Node::new("a", "local", 1);
        let b = Node::new("b", "local", 2);
        let err = network.transport_for(&a).connect(&b).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_isolate_closes_links_and_refuses_new_ones() {
        let network = LocalNetwork::new();
        let a = Node::new("a", "local", 1);
        let b = Node::new("b", "local", 2);
        let mut listener = network.transport_for(&b).bind(&b).await.unwrap();
        let mut client = network.transport_for(&a).connect(&b).await.unwrap();
        let _server = listener.accept().await.unwrap();

        network.isolate(&b);
        let closed = tokio::time::timeout(Duration::from_secs(1), client.rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert!(network.transport_for(&a).connect(&b).await.is_err());

        network.heal(&b);
        assert!(network.transport_for(&a).connect(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let node = Node::new("tcp", "127.0.0.1", port);

        let mut listener = TcpTransport.bind(&node).await.unwrap();
        let mut client = TcpTransport.connect(&node).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.tx.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(server.rx.recv().await.unwrap(), Bytes::from_static(b"hello"));

        drop(client);
        assert!(server.rx.recv().await.is_none());
    }
}
