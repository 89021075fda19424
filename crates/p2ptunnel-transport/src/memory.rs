//! In-process peer network
//!
//! Nodes join a shared [`MemoryHub`] and exchange channels built from
//! `tokio::io::duplex` pairs. The hub can take nodes offline, inject dial
//! failures and counts what each node did, which is what the tunnel tests
//! assert against.

use crate::{InboundHandler, NetworkError, NetworkResult, PeerChannel, PeerNetwork};
use async_trait::async_trait;
use p2ptunnel_proto::PeerId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::debug;

/// Buffer size of each in-memory channel direction
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Per-node activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Calls to `open_channel` made by this node
    pub open_attempts: usize,
    /// Channels this node opened successfully
    pub channels_opened: usize,
    /// Channels delivered to this node's inbound handlers
    pub channels_accepted: usize,
    /// Calls to `resolve_and_connect` made by this node
    pub dial_attempts: usize,
    /// Channels this node reset
    pub resets: usize,
}

struct Node {
    online: bool,
    handlers: HashMap<String, InboundHandler<MemoryChannel>>,
    failures_pending: usize,
    stats: NodeStats,
}

impl Node {
    fn new() -> Self {
        Self {
            online: true,
            handlers: HashMap::new(),
            failures_pending: 0,
            stats: NodeStats::default(),
        }
    }
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<PeerId, Node>,
    links: HashSet<(PeerId, PeerId)>,
    next_channel_id: u64,
}

impl HubState {
    fn online_node_mut(&mut self, peer: &PeerId) -> Option<&mut Node> {
        self.nodes.get_mut(peer).filter(|node| node.online)
    }

    fn link(&mut self, a: &PeerId, b: &PeerId) {
        self.links.insert((a.clone(), b.clone()));
        self.links.insert((b.clone(), a.clone()));
    }

    fn unlink_all(&mut self, peer: &PeerId) {
        self.links.retain(|(a, b)| a != peer && b != peer);
    }
}

/// Shared medium that in-memory nodes attach to
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a node (or bring a known node back online)
    pub fn join(&self, peer: PeerId) -> MemoryNetwork {
        self.state()
            .nodes
            .entry(peer.clone())
            .or_insert_with(Node::new)
            .online = true;

        MemoryNetwork {
            local: peer,
            hub: self.clone(),
        }
    }

    /// Take a node offline or bring it back; going offline drops its links
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        let mut state = self.state();
        if let Some(node) = state.nodes.get_mut(peer) {
            node.online = online;
        }
        if !online {
            state.unlink_all(peer);
        }
    }

    /// Make the next `count` channel opens towards `peer` fail as unreachable
    pub fn fail_next_opens(&self, peer: &PeerId, count: usize) {
        if let Some(node) = self.state().nodes.get_mut(peer) {
            node.failures_pending = count;
        }
    }

    /// Drop the connection between two nodes, if any
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state();
        state.links.remove(&(a.clone(), b.clone()));
        state.links.remove(&(b.clone(), a.clone()));
    }

    /// Counters for `peer` (all zero for unknown peers)
    pub fn stats(&self, peer: &PeerId) -> NodeStats {
        self.state()
            .nodes
            .get(peer)
            .map(|node| node.stats)
            .unwrap_or_default()
    }

    fn record_reset(&self, peer: &PeerId) {
        if let Some(node) = self.state().nodes.get_mut(peer) {
            node.stats.resets += 1;
        }
    }
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryHub")
            .field("nodes", &state.nodes.len())
            .field("links", &(state.links.len() / 2))
            .finish()
    }
}

/// One node on a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryNetwork {
    local: PeerId,
    hub: MemoryHub,
}

impl MemoryNetwork {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("local", &self.local)
            .finish()
    }
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    type Channel = MemoryChannel;

    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    async fn open_channel(&self, peer: &PeerId, protocol: &str) -> NetworkResult<MemoryChannel> {
        let (handler, channel_id) = {
            let mut state = self.hub.state();

            match state.online_node_mut(&self.local) {
                Some(local) => local.stats.open_attempts += 1,
                None => return Err(NetworkError::Closed),
            }

            let target = state
                .online_node_mut(peer)
                .ok_or_else(|| NetworkError::NoAddress(peer.clone()))?;

            if target.failures_pending > 0 {
                target.failures_pending -= 1;
                return Err(NetworkError::Unreachable(
                    peer.clone(),
                    "failed to dial".to_string(),
                ));
            }

            let handler = target
                .handlers
                .get(protocol)
                .cloned()
                .ok_or_else(|| NetworkError::ProtocolNotSupported(protocol.to_string()))?;
            target.stats.channels_accepted += 1;

            if let Some(local) = state.nodes.get_mut(&self.local) {
                local.stats.channels_opened += 1;
            }
            state.link(&self.local, peer);
            state.next_channel_id += 1;

            (handler, state.next_channel_id)
        };

        let (near, far) = tokio::io::duplex(DUPLEX_CAPACITY);
        let reset = Arc::new(AtomicBool::new(false));

        let inbound = MemoryChannel {
            stream: Some(far),
            reset: reset.clone(),
            owner: peer.clone(),
            remote: self.local.clone(),
            id: channel_id,
            hub: self.hub.clone(),
        };
        tokio::spawn(handler(inbound));

        debug!(peer = ?peer, channel_id, protocol, "Opened in-memory channel");

        Ok(MemoryChannel {
            stream: Some(near),
            reset,
            owner: self.local.clone(),
            remote: peer.clone(),
            id: channel_id,
            hub: self.hub.clone(),
        })
    }

    fn set_inbound_handler(&self, protocol: &str, handler: InboundHandler<MemoryChannel>) {
        if let Some(node) = self.hub.state().nodes.get_mut(&self.local) {
            node.handlers.insert(protocol.to_string(), handler);
        }
    }

    fn remove_inbound_handler(&self, protocol: &str) {
        if let Some(node) = self.hub.state().nodes.get_mut(&self.local) {
            node.handlers.remove(protocol);
        }
    }

    async fn resolve_and_connect(&self, peer: &PeerId) -> NetworkResult<()> {
        let mut state = self.hub.state();

        match state.online_node_mut(&self.local) {
            Some(local) => local.stats.dial_attempts += 1,
            None => return Err(NetworkError::Closed),
        }

        if state.online_node_mut(peer).is_none() {
            return Err(NetworkError::NoAddress(peer.clone()));
        }

        state.link(&self.local, peer);
        Ok(())
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.hub
            .state()
            .links
            .contains(&(self.local.clone(), peer.clone()))
    }

    async fn close(&self) {
        let mut state = self.hub.state();
        if let Some(node) = state.nodes.get_mut(&self.local) {
            node.online = false;
            node.handlers.clear();
        }
        state.unlink_all(&self.local);
    }
}

/// In-memory channel end
///
/// Both ends share a reset flag: once either side resets, every read or write
/// on the pair fails with `ConnectionReset` instead of seeing a clean close.
pub struct MemoryChannel {
    stream: Option<DuplexStream>,
    reset: Arc<AtomicBool>,
    owner: PeerId,
    remote: PeerId,
    id: u64,
    hub: MemoryHub,
}

impl MemoryChannel {
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// The live stream, or `ConnectionReset` if either end reset the pair
    fn stream(&mut self) -> io::Result<&mut DuplexStream> {
        if self.is_reset() {
            return Err(reset_error());
        }
        self.stream.as_mut().ok_or_else(reset_error)
    }

    /// Turn a completed poll into `ConnectionReset` if the pair was reset
    /// while it ran, so a wake-up caused by the reset is not read as EOF
    fn checked<T>(&self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        match poll {
            Poll::Ready(_) if self.is_reset() => Poll::Ready(Err(reset_error())),
            other => other,
        }
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "channel reset")
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("reset", &self.is_reset())
            .finish()
    }
}

impl PeerChannel for MemoryChannel {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn channel_id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self) {
        self.reset.store(true, Ordering::Release);
        if self.stream.take().is_some() {
            self.hub.record_reset(&self.owner);
        }
    }
}

impl AsyncRead for MemoryChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.checked(poll)
    }
}

impl AsyncWrite for MemoryChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match this.stream() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.checked(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.checked(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match this.stream() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.checked(poll)
    }
}
