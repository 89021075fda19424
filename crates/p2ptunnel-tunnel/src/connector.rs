//! Connector role: bridge local TCP connections to the remote agent
//!
//! Every accepted connection is one exchange: a single read of the client's
//! request, one framed request to the selected peer, then every reply frame
//! relayed back until the agent ends the channel. Failures surface to the
//! client only as a closed connection.

use crate::agent::log_headers;
use crate::httplog::HeaderCapture;
use crate::retry::RetryPolicy;
use crate::selector::PeerSelector;
use p2ptunnel_proto::{
    read_message, write_full, write_message, CodecError, PeerId, MAX_PAYLOAD_SIZE, PROTOCOL,
};
use p2ptunnel_transport::{NetworkError, PeerChannel, PeerNetwork};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default local port the connector listens on
pub const DEFAULT_CONNECTOR_PORT: u16 = 8012;

/// Errors that end one connector exchange
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },

    #[error("Failed to read request from local client: {0}")]
    ClientRead(#[source] io::Error),

    #[error("Request of {0} bytes does not fit in one frame")]
    RequestTooLarge(usize),

    #[error("Failed to open channel to {peer}: {source}")]
    Open {
        peer: PeerId,
        #[source]
        source: NetworkError,
    },

    #[error("Failed to read reply: {0}")]
    ReplyRead(#[source] CodecError),

    #[error("Peer closed the channel without replying")]
    EmptyReply,

    #[error("Failed to write reply to local client: {0}")]
    ClientWrite(#[source] CodecError),
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Local TCP address clients connect to
    pub listen_addr: SocketAddr,
    /// Bound on each accept so cancellation is noticed promptly
    pub accept_timeout: Duration,
    /// Largest request read from a client
    pub request_buffer_size: usize,
    /// Retry behavior when the peer is unreachable
    pub retry: RetryPolicy,
    /// Echo request/reply headers to the log
    pub verbose: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONNECTOR_PORT)),
            accept_timeout: Duration::from_secs(1),
            request_buffer_size: MAX_PAYLOAD_SIZE,
            retry: RetryPolicy::default(),
            verbose: false,
        }
    }
}

impl ConnectorConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Byte counts of one completed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeStats {
    pub request_bytes: usize,
    pub reply_bytes: usize,
    /// Channel opens it took, including the successful one
    pub attempts: usize,
}

/// Exposes the remote agent's service on a local TCP port
#[derive(Debug)]
pub struct Connector<N: PeerNetwork> {
    network: Arc<N>,
    selector: Arc<dyn PeerSelector>,
    config: ConnectorConfig,
}

impl<N: PeerNetwork> Connector<N> {
    pub fn new(network: Arc<N>, selector: Arc<dyn PeerSelector>, config: ConnectorConfig) -> Self {
        Self {
            network,
            selector,
            config,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, ConnectorError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|source| ConnectorError::Bind {
                address: self.config.listen_addr,
                source,
            })?;

        info!(
            addr = %listener.local_addr().unwrap_or(self.config.listen_addr),
            peer = %self.selector.select().name,
            "Connector listening"
        );

        Ok(listener)
    }

    /// Accept local connections until `cancel` fires
    ///
    /// Exchanges already in flight keep running to completion.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = tokio::time::timeout(self.config.accept_timeout, listener.accept()) => accepted,
            };

            match accepted {
                // Timeout just means no client yet
                Err(_) => continue,
                Ok(Ok((stream, addr))) => {
                    debug!(client = %addr, "Accepted local connection");
                    let connector = Arc::clone(&self);
                    tokio::spawn(async move {
                        match connector.handle_connection(stream).await {
                            Ok(Some(stats)) => debug!(
                                client = %addr,
                                bytes_in = stats.request_bytes,
                                bytes_out = stats.reply_bytes,
                                attempts = stats.attempts,
                                "Exchange completed"
                            ),
                            Ok(None) => debug!(client = %addr, "Client closed without a request"),
                            Err(e) => warn!(client = %addr, error = %e, "Connector exchange failed"),
                        }
                    });
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to accept local connection");
                }
            }
        }

        info!("Connector stopped accepting connections");
    }

    /// Serve one local client; `Ok(None)` when it sent nothing
    pub async fn handle_connection(
        &self,
        mut stream: TcpStream,
    ) -> Result<Option<ExchangeStats>, ConnectorError> {
        let mut buffer = vec![0u8; self.config.request_buffer_size.clamp(1, MAX_PAYLOAD_SIZE)];
        let n = stream
            .read(&mut buffer)
            .await
            .map_err(ConnectorError::ClientRead)?;

        if n == 0 {
            return Ok(None);
        }

        let stats = self.send_to_remote(&buffer[..n], &mut stream).await?;
        let _ = stream.shutdown().await;

        Ok(Some(stats))
    }

    /// Deliver `body` to the selected peer and copy its reply into `local`
    pub async fn send_to_remote<W>(
        &self,
        body: &[u8],
        local: &mut W,
    ) -> Result<ExchangeStats, ConnectorError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(ConnectorError::RequestTooLarge(body.len()));
        }

        let peer = self.selector.select();
        let mut attempts = 0;

        let mut channel = self
            .config
            .retry
            .retry(|| {
                attempts += 1;
                self.network.open_channel(&peer.id, PROTOCOL)
            })
            .await
            .map_err(|source| ConnectorError::Open {
                peer: peer.id.clone(),
                source,
            })?;

        debug!(
            peer = %peer.name,
            channel_id = channel.channel_id(),
            attempts,
            "Opened tunnel channel"
        );

        let result = self.exchange(&mut channel, body, local).await;
        match &result {
            Ok(_) => {
                let _ = channel.shutdown().await;
            }
            Err(_) => channel.reset(),
        }

        result.map(|(request_bytes, reply_bytes)| ExchangeStats {
            request_bytes,
            reply_bytes,
            attempts,
        })
    }

    async fn exchange<W>(
        &self,
        channel: &mut N::Channel,
        body: &[u8],
        local: &mut W,
    ) -> Result<(usize, usize), ConnectorError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.config.verbose {
            log_headers("request", body);
        }

        if let Err(e) = write_message(channel, body).await {
            // Not fatal on its own; the reply read decides
            warn!(error = %e, "Request write failed");
        }

        let mut reply_tap = self.config.verbose.then(HeaderCapture::capture);
        let mut reply_bytes = 0;

        while let Some(frame) = read_message(channel)
            .await
            .map_err(ConnectorError::ReplyRead)?
        {
            if let Some(tap) = reply_tap.as_mut() {
                let _ = tap.print(&frame);
            }

            write_full(local, &frame)
                .await
                .map_err(ConnectorError::ClientWrite)?;
            reply_bytes += frame.len();
        }

        if let Some(tap) = reply_tap {
            debug!(direction = "reply", headers = %tap.text(), "HTTP headers");
        }

        if reply_bytes == 0 {
            return Err(ConnectorError::EmptyReply);
        }

        local
            .flush()
            .await
            .map_err(|e| ConnectorError::ClientWrite(CodecError::Io(e)))?;

        Ok((body.len(), reply_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEntry;
    use crate::selector::SinglePeerSelector;
    use p2ptunnel_transport::inbound_handler;
    use p2ptunnel_transport::memory::{MemoryChannel, MemoryHub, MemoryNetwork};
    use tokio::time::Instant;

    struct Fixture {
        hub: MemoryHub,
        agent: MemoryNetwork,
        connector: Connector<MemoryNetwork>,
    }

    fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let agent = hub.join(PeerId::fingerprint(b"agent"));
        let local = hub.join(PeerId::fingerprint(b"connector"));

        let selector = SinglePeerSelector::new(RegistryEntry {
            name: "agent".to_string(),
            id: agent.local_peer_id().clone(),
        });

        let connector = Connector::new(
            Arc::new(local),
            Arc::new(selector),
            ConnectorConfig::default(),
        );

        Fixture {
            hub,
            agent,
            connector,
        }
    }

    /// Answers each request frame with the same bytes reversed
    fn serve_reverse(network: &MemoryNetwork) {
        network.set_inbound_handler(
            PROTOCOL,
            inbound_handler(|mut channel: MemoryChannel| async move {
                if let Ok(Some(request)) = read_message(&mut channel).await {
                    let reply: Vec<u8> = request.iter().rev().copied().collect();
                    let _ = write_message(&mut channel, &reply).await;
                }
                let _ = channel.shutdown().await;
            }),
        );
    }

    #[tokio::test]
    async fn test_send_to_remote() {
        let f = fixture();
        serve_reverse(&f.agent);

        let mut reply = Vec::new();
        let stats = f.connector.send_to_remote(b"PING", &mut reply).await.unwrap();

        assert_eq!(reply, b"GNIP");
        assert_eq!(
            stats,
            ExchangeStats {
                request_bytes: 4,
                reply_bytes: 4,
                attempts: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_unreachable_peer_with_fixed_delay() {
        let f = fixture();
        serve_reverse(&f.agent);
        f.hub.fail_next_opens(f.agent.local_peer_id(), 3);

        let start = Instant::now();
        let mut reply = Vec::new();
        let stats = f.connector.send_to_remote(b"PING", &mut reply).await.unwrap();

        assert_eq!(reply, b"GNIP");
        assert_eq!(stats.attempts, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_offline_peer() {
        let f = fixture();
        serve_reverse(&f.agent);
        f.hub.set_online(f.agent.local_peer_id(), false);

        let hub = f.hub.clone();
        let agent_id = f.agent.local_peer_id().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            hub.set_online(&agent_id, true);
        });

        let mut reply = Vec::new();
        let stats = f.connector.send_to_remote(b"hi", &mut reply).await.unwrap();

        assert_eq!(reply, b"ih");
        assert_eq!(stats.attempts, 4);
    }

    #[tokio::test]
    async fn test_fatal_open_error_is_not_retried() {
        let f = fixture();
        // No handler registered: the agent does not speak the protocol

        let mut reply = Vec::new();
        let err = f
            .connector
            .send_to_remote(b"PING", &mut reply)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConnectorError::Open {
                source: NetworkError::ProtocolNotSupported(_),
                ..
            }
        ));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_reset_by_agent_fails_exchange() {
        let f = fixture();
        f.agent.set_inbound_handler(
            PROTOCOL,
            inbound_handler(|mut channel: MemoryChannel| async move {
                channel.reset();
            }),
        );

        let mut reply = Vec::new();
        let err = f
            .connector
            .send_to_remote(b"PING", &mut reply)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::ReplyRead(_)));
        assert!(reply.is_empty());
        assert_eq!(f.hub.stats(f.agent.local_peer_id()).resets, 1);
    }

    #[tokio::test]
    async fn test_reset_after_partial_reply_fails_exchange() {
        let f = fixture();
        f.agent.set_inbound_handler(
            PROTOCOL,
            inbound_handler(|mut channel: MemoryChannel| async move {
                if let Ok(Some(_request)) = read_message(&mut channel).await {
                    let _ = write_message(&mut channel, b"PARTIAL").await;
                }
                channel.reset();
            }),
        );

        let mut reply = Vec::new();
        let err = f
            .connector
            .send_to_remote(b"PING", &mut reply)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::ReplyRead(_)));
    }

    #[tokio::test]
    async fn test_close_without_reply_is_empty_reply() {
        let f = fixture();
        f.agent.set_inbound_handler(
            PROTOCOL,
            inbound_handler(|mut channel: MemoryChannel| async move {
                let _ = read_message(&mut channel).await;
                let _ = channel.shutdown().await;
            }),
        );

        let mut reply = Vec::new();
        let err = f
            .connector
            .send_to_remote(b"PING", &mut reply)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::EmptyReply));
        assert_eq!(f.hub.stats(f.connector.network.local_peer_id()).resets, 1);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_before_dialing() {
        let f = fixture();
        serve_reverse(&f.agent);

        let body = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let mut reply = Vec::new();
        let err = f
            .connector
            .send_to_remote(&body, &mut reply)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::RequestTooLarge(_)));
        assert_eq!(f.hub.stats(f.connector.network.local_peer_id()).open_attempts, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        let connector = Arc::new(Connector::new(
            f.connector.network.clone(),
            f.connector.selector.clone(),
            ConnectorConfig::default()
                .with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0))),
        ));

        let listener = connector.bind().await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(connector.run(listener, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
