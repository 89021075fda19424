//! QUIC implementation of [`PeerNetwork`]

use crate::channel::QuicChannel;
use crate::config::QuicConfig;
use crate::identity::NodeIdentity;
use crate::{ensure_crypto_provider, SERVER_NAME};
use async_trait::async_trait;
use p2ptunnel_proto::PeerId;
use p2ptunnel_transport::{InboundHandler, NetworkError, NetworkResult, PeerChannel, PeerNetwork};
use quinn::rustls::pki_types::CertificateDer;
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream, VarInt};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status byte sent by the acceptor once the protocol header is read
const STATUS_ACCEPTED: u8 = 0;
const STATUS_UNSUPPORTED: u8 = 1;

/// How long `close` waits for peers to acknowledge
const CLOSE_GRACE: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    endpoint: Endpoint,
    identity: NodeIdentity,
    config: QuicConfig,
    addresses: RwLock<HashMap<PeerId, String>>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    handlers: Mutex<HashMap<String, InboundHandler<QuicChannel>>>,
    next_channel_id: AtomicU64,
}

impl Inner {
    fn next_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Connection> {
        lock(&self.connections)
            .get(peer)
            .filter(|connection| connection.close_reason().is_none())
            .cloned()
    }

    fn remember_connection(&self, peer: &PeerId, connection: &Connection) {
        lock(&self.connections).insert(peer.clone(), connection.clone());
    }

    fn forget_connection(&self, peer: &PeerId, connection: &Connection) {
        let mut connections = lock(&self.connections);
        if connections.get(peer).map(Connection::stable_id) == Some(connection.stable_id()) {
            connections.remove(peer);
        }
    }

    fn handler_for(&self, protocol: &str) -> Option<InboundHandler<QuicChannel>> {
        lock(&self.handlers).get(protocol).cloned()
    }

    fn address_of(&self, peer: &PeerId) -> Option<String> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }
}

/// A node on the QUIC peer network
#[derive(Clone)]
pub struct QuicNetwork {
    inner: Arc<Inner>,
}

impl QuicNetwork {
    /// Bind the endpoint and start accepting connections
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(identity: NodeIdentity, config: QuicConfig) -> NetworkResult<Self> {
        ensure_crypto_provider();
        config.validate()?;

        let server_config = config.build_server_config(&identity)?;
        let endpoint =
            Endpoint::server(server_config, config.bind_addr).map_err(NetworkError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(NetworkError::IoError)?;
        info!(
            peer_id = %identity.peer_id(),
            addr = %local_addr,
            "QUIC peer endpoint bound"
        );

        let inner = Arc::new(Inner {
            endpoint,
            identity,
            config,
            addresses: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU64::new(0),
        });

        tokio::spawn(accept_loop(inner.clone()));

        Ok(Self { inner })
    }

    /// Record where `peer` can be dialed (`host:port`)
    pub fn add_address(&self, peer: PeerId, addr: impl Into<String>) {
        self.inner
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, addr.into());
    }

    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.inner.endpoint.local_addr().map_err(NetworkError::IoError)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    async fn resolve(&self, peer: &PeerId) -> NetworkResult<SocketAddr> {
        let addr = self
            .inner
            .address_of(peer)
            .ok_or_else(|| NetworkError::NoAddress(peer.clone()))?;

        let resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|e| NetworkError::Unreachable(peer.clone(), format!("resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| NetworkError::NoAddress(peer.clone()));
        resolved
    }

    async fn connection_to(&self, peer: &PeerId) -> NetworkResult<Connection> {
        if let Some(connection) = self.inner.live_connection(peer) {
            return Ok(connection);
        }

        let addr = self.resolve(peer).await?;
        let client_config = self
            .inner
            .config
            .build_client_config(&self.inner.identity, peer)?;

        debug!(peer = %peer.short(), %addr, "Dialing peer");

        let connecting = self
            .inner
            .endpoint
            .connect_with(client_config, addr, SERVER_NAME)
            .map_err(|e| match e {
                quinn::ConnectError::EndpointStopping => NetworkError::Closed,
                other => NetworkError::ConnectionError(other.to_string()),
            })?;

        let connection = match tokio::time::timeout(self.inner.config.connect_timeout, connecting)
            .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(map_connection_error(peer, e)),
            Err(_) => {
                return Err(NetworkError::Unreachable(
                    peer.clone(),
                    format!("dial to {} timed out", addr),
                ))
            }
        };

        info!(peer = %peer.short(), %addr, "Connected to peer");

        self.inner.remember_connection(peer, &connection);
        tokio::spawn(serve_connection(
            self.inner.clone(),
            connection.clone(),
            peer.clone(),
        ));

        Ok(connection)
    }
}

impl fmt::Debug for QuicNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicNetwork")
            .field("local", self.inner.identity.peer_id())
            .field("addr", &self.inner.endpoint.local_addr().ok())
            .finish()
    }
}

#[async_trait]
impl PeerNetwork for QuicNetwork {
    type Channel = QuicChannel;

    fn local_peer_id(&self) -> &PeerId {
        self.inner.identity.peer_id()
    }

    async fn open_channel(&self, peer: &PeerId, protocol: &str) -> NetworkResult<QuicChannel> {
        let tag_len = u8::try_from(protocol.len()).map_err(|_| {
            NetworkError::ConfigurationError(format!("Protocol tag too long: {}", protocol))
        })?;

        let connection = self.connection_to(peer).await?;
        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| map_connection_error(peer, e))?;

        let mut header = Vec::with_capacity(1 + protocol.len());
        header.push(tag_len);
        header.extend_from_slice(protocol.as_bytes());
        send.write_all(&header)
            .await
            .map_err(|e| NetworkError::ConnectionError(e.to_string()))?;

        let mut status = [0u8; 1];
        recv.read_exact(&mut status)
            .await
            .map_err(|e| NetworkError::ConnectionError(format!("protocol negotiation: {}", e)))?;

        if status[0] != STATUS_ACCEPTED {
            return Err(NetworkError::ProtocolNotSupported(protocol.to_string()));
        }

        let channel_id = self.inner.next_channel_id();
        debug!(peer = %peer.short(), channel_id, protocol, "Opened channel");

        Ok(QuicChannel::new(send, recv, peer.clone(), channel_id))
    }

    fn set_inbound_handler(&self, protocol: &str, handler: InboundHandler<QuicChannel>) {
        lock(&self.inner.handlers).insert(protocol.to_string(), handler);
    }

    fn remove_inbound_handler(&self, protocol: &str) {
        lock(&self.inner.handlers).remove(protocol);
    }

    async fn resolve_and_connect(&self, peer: &PeerId) -> NetworkResult<()> {
        self.connection_to(peer).await.map(|_| ())
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.live_connection(peer).is_some()
    }

    async fn close(&self) {
        lock(&self.inner.handlers).clear();
        self.inner
            .endpoint
            .close(VarInt::from_u32(0), b"node shutting down");
        lock(&self.inner.connections).clear();

        if tokio::time::timeout(CLOSE_GRACE, self.inner.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("Peers did not acknowledge close in time");
        }

        info!("QUIC peer endpoint closed");
    }
}

fn map_connection_error(peer: &PeerId, err: ConnectionError) -> NetworkError {
    match &err {
        ConnectionError::TimedOut
        | ConnectionError::Reset
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::ApplicationClosed(_) => {
            NetworkError::Unreachable(peer.clone(), err.to_string())
        }
        ConnectionError::LocallyClosed => NetworkError::Closed,
        _ => NetworkError::ConnectionError(err.to_string()),
    }
}

fn remote_peer_id(connection: &Connection) -> Option<PeerId> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    certs.first().map(|cert| PeerId::fingerprint(cert.as_ref()))
}

async fn accept_loop(inner: Arc<Inner>) {
    while let Some(incoming) = inner.endpoint.accept().await {
        let inner = inner.clone();
        tokio::spawn(async move {
            let remote_addr = incoming.remote_address();
            debug!(addr = %remote_addr, "Incoming QUIC connection");

            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(addr = %remote_addr, error = %e, "Failed to establish QUIC connection");
                    return;
                }
            };

            let Some(peer) = remote_peer_id(&connection) else {
                warn!(addr = %remote_addr, "Peer presented no certificate");
                connection.close(VarInt::from_u32(1), b"missing peer certificate");
                return;
            };

            info!(peer = %peer.short(), addr = %remote_addr, "Accepted peer connection");
            inner.remember_connection(&peer, &connection);
            serve_connection(inner, connection, peer).await;
        });
    }

    debug!("QUIC accept loop finished");
}

async fn serve_connection(inner: Arc<Inner>, connection: Connection, peer: PeerId) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                tokio::spawn(dispatch(inner.clone(), send, recv, peer.clone()));
            }
            Err(e) => {
                debug!(peer = %peer.short(), reason = %e, "Peer connection closed");
                break;
            }
        }
    }

    inner.forget_connection(&peer, &connection);
}

async fn read_protocol_header(recv: &mut RecvStream) -> Result<String, String> {
    let mut len = [0u8; 1];
    recv.read_exact(&mut len).await.map_err(|e| e.to_string())?;

    let mut tag = vec![0u8; usize::from(len[0])];
    recv.read_exact(&mut tag).await.map_err(|e| e.to_string())?;

    String::from_utf8(tag).map_err(|e| e.to_string())
}

async fn dispatch(inner: Arc<Inner>, mut send: SendStream, mut recv: RecvStream, peer: PeerId) {
    let protocol = match read_protocol_header(&mut recv).await {
        Ok(protocol) => protocol,
        Err(e) => {
            debug!(peer = %peer.short(), error = %e, "Bad channel header");
            let _ = send.reset(VarInt::from_u32(1));
            return;
        }
    };

    let Some(handler) = inner.handler_for(&protocol) else {
        debug!(peer = %peer.short(), protocol, "No handler for protocol");
        if send.write_all(&[STATUS_UNSUPPORTED]).await.is_ok() {
            let _ = send.finish();
        }
        return;
    };

    if let Err(e) = send.write_all(&[STATUS_ACCEPTED]).await {
        debug!(peer = %peer.short(), error = %e, "Channel dropped during negotiation");
        return;
    }

    let channel_id = inner.next_channel_id();
    let channel = QuicChannel::new(send, recv, peer, channel_id);
    debug!(
        peer = %channel.remote_peer().short(),
        channel_id,
        protocol,
        "Inbound channel"
    );

    handler(channel).await;
}
