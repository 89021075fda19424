//! Agent role: serve inbound tunnel channels from a local TCP service
//!
//! Each inbound channel carries exactly one exchange:
//!
//! ```text
//! authorize peer ─► read request frame ─► dial local service ─► write request
//!        │                                                           │
//!   reset channel            shutdown channel ◄─ relay reply chunks ◄┘
//! ```
//!
//! The channel is reset on every failure path and shut down gracefully
//! otherwise; the local connection is dropped once the exchange ends.

use crate::httplog::HeaderCapture;
use crate::registry::PeerRegistry;
use p2ptunnel_proto::{read_message, write_full, write_message, CodecError, MAX_PAYLOAD_SIZE, PROTOCOL};
use p2ptunnel_transport::{inbound_handler, PeerChannel, PeerNetwork};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Errors that end one agent session
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to read request: {0}")]
    Request(#[source] CodecError),

    #[error("Failed to connect to local service {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: io::Error,
    },

    #[error("Failed to forward request to local service: {0}")]
    Forward(#[source] CodecError),

    #[error("Failed to read reply from local service: {0}")]
    ServiceRead(#[source] io::Error),

    #[error("Failed to relay reply to peer: {0}")]
    Reply(#[source] CodecError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Host of the local service
    pub forward_host: String,
    /// Port of the local service
    pub forward_port: u16,
    /// Largest chunk read from the local service per reply frame
    pub reply_buffer_size: usize,
    /// Echo request/reply headers to the log
    pub verbose: bool,
}

impl AgentConfig {
    pub fn new(forward_port: u16) -> Self {
        Self {
            forward_host: "127.0.0.1".to_string(),
            forward_port,
            reply_buffer_size: MAX_PAYLOAD_SIZE,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn forward_address(&self) -> String {
        format!("{}:{}", self.forward_host, self.forward_port)
    }
}

/// How a session ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The remote peer is not in the registry; the channel was reset
    Rejected,
    /// The peer closed the channel without sending a request
    Empty,
    Forwarded {
        request_bytes: usize,
        reply_bytes: usize,
    },
}

/// Exposes one local TCP service to authorized peers
#[derive(Debug)]
pub struct Agent {
    registry: Arc<PeerRegistry>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(registry: Arc<PeerRegistry>, config: AgentConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Install the tunnel protocol handler on `network`
    pub fn register<N: PeerNetwork>(self: &Arc<Self>, network: &N) {
        let agent = Arc::clone(self);
        network.set_inbound_handler(
            PROTOCOL,
            inbound_handler(move |mut channel: N::Channel| {
                let agent = agent.clone();
                async move {
                    agent.serve(&mut channel).await;
                }
            }),
        );

        info!(
            protocol = PROTOCOL,
            forward = %self.config.forward_address(),
            authorized_peers = self.registry.len(),
            "Agent handler registered"
        );
    }

    async fn serve<C: PeerChannel>(&self, channel: &mut C) {
        let channel_id = channel.channel_id();

        match self.handle_channel(channel).await {
            Ok(SessionOutcome::Forwarded {
                request_bytes,
                reply_bytes,
            }) => {
                debug!(
                    channel_id,
                    bytes_in = request_bytes,
                    bytes_out = reply_bytes,
                    "Exchange completed"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(channel_id, error = %e, "Agent session failed");
            }
        }
    }

    /// Run one session on `channel`, closing it exactly once
    pub async fn handle_channel<C: PeerChannel>(
        &self,
        channel: &mut C,
    ) -> Result<SessionOutcome, AgentError> {
        let peer = channel.remote_peer().clone();

        if !self.registry.authorize(&peer) {
            debug!(peer = %peer.short(), "Rejecting unauthorized peer");
            channel.reset();
            return Ok(SessionOutcome::Rejected);
        }

        debug!(
            peer = self.registry.name_of(&peer).unwrap_or_default(),
            channel_id = channel.channel_id(),
            "Inbound channel"
        );

        let result = self.exchange(channel).await;
        match &result {
            Ok(_) => {
                let _ = channel.shutdown().await;
            }
            Err(_) => channel.reset(),
        }

        result
    }

    async fn exchange<C: PeerChannel>(&self, channel: &mut C) -> Result<SessionOutcome, AgentError> {
        let Some(request) = read_message(channel).await.map_err(AgentError::Request)? else {
            return Ok(SessionOutcome::Empty);
        };

        if self.config.verbose {
            log_headers("request", &request);
        }

        let address = self.config.forward_address();
        let mut service =
            TcpStream::connect(&address)
                .await
                .map_err(|source| AgentError::ConnectionFailed {
                    address: address.clone(),
                    source,
                })?;

        write_full(&mut service, &request)
            .await
            .map_err(AgentError::Forward)?;

        let mut reply_tap = self.config.verbose.then(HeaderCapture::capture);
        let mut buffer = vec![0u8; self.config.reply_buffer_size.clamp(1, MAX_PAYLOAD_SIZE)];
        let mut reply_bytes = 0;

        loop {
            let n = service
                .read(&mut buffer)
                .await
                .map_err(AgentError::ServiceRead)?;
            if n == 0 {
                break;
            }

            if let Some(tap) = reply_tap.as_mut() {
                let _ = tap.print(&buffer[..n]);
            }

            write_message(channel, &buffer[..n])
                .await
                .map_err(AgentError::Reply)?;
            reply_bytes += n;

            // A short read means the service has nothing more for this exchange
            if n < buffer.len() {
                break;
            }
        }

        if let Some(tap) = reply_tap {
            debug!(direction = "reply", headers = %tap.text(), "HTTP headers");
        }

        Ok(SessionOutcome::Forwarded {
            request_bytes: request.len(),
            reply_bytes,
        })
    }
}

pub(crate) fn log_headers(direction: &str, payload: &[u8]) {
    let mut tap = HeaderCapture::capture();
    let _ = tap.print(payload);
    debug!(direction, headers = %tap.text(), "HTTP headers");
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2ptunnel_proto::{PeerId, TunnelCodec};
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::TcpListener;

    /// Channel fed from a fixed byte script, recording what is written
    #[derive(Debug)]
    struct ScriptedChannel {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
        write_limit: Option<usize>,
        remote: PeerId,
        shutdowns: usize,
        resets: usize,
    }

    impl ScriptedChannel {
        fn new(remote: PeerId, input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                written: Vec::new(),
                write_limit: None,
                remote,
                shutdowns: 0,
                resets: 0,
            }
        }

        fn framed(remote: PeerId, payload: &[u8]) -> Self {
            Self::new(remote, TunnelCodec::encode_frame(payload).unwrap().to_vec())
        }
    }

    impl PeerChannel for ScriptedChannel {
        fn remote_peer(&self) -> &PeerId {
            &self.remote
        }

        fn channel_id(&self) -> u64 {
            7
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    impl AsyncRead for ScriptedChannel {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for ScriptedChannel {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let room = this
                .write_limit
                .map(|limit| limit.saturating_sub(this.written.len()))
                .unwrap_or(buf.len());
            let n = room.min(buf.len());
            this.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.get_mut().shutdowns += 1;
            Poll::Ready(Ok(()))
        }
    }

    fn peer(seed: &str) -> PeerId {
        PeerId::fingerprint(seed.as_bytes())
    }

    fn agent_for(port: u16) -> Agent {
        let registry = PeerRegistry::new([("connector".to_string(), peer("connector"))]).unwrap();
        Agent::new(Arc::new(registry), AgentConfig::new(port))
    }

    /// Local service that answers every request with `reply`
    async fn spawn_service(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(reply).await.unwrap();
            buf.truncate(n);
            buf
        });

        (port, handle)
    }

    #[tokio::test]
    async fn test_forwards_authorized_exchange() {
        let (port, service) = spawn_service(b"PONG").await;
        let agent = agent_for(port);
        let mut channel = ScriptedChannel::framed(peer("connector"), b"PING");

        let outcome = agent.handle_channel(&mut channel).await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Forwarded {
                request_bytes: 4,
                reply_bytes: 4
            }
        );
        assert_eq!(service.await.unwrap(), b"PING");
        assert_eq!(channel.written, [0x04, 0x00, b'P', b'O', b'N', b'G']);
        assert_eq!(channel.shutdowns, 1);
        assert_eq!(channel.resets, 0);
    }

    #[tokio::test]
    async fn test_rejects_unknown_peer_without_forwarding() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = agent_for(listener.local_addr().unwrap().port());
        let mut channel = ScriptedChannel::framed(peer("stranger"), b"PING");

        let outcome = agent.handle_channel(&mut channel).await.unwrap();

        assert_eq!(outcome, SessionOutcome::Rejected);
        assert_eq!(channel.resets, 1);
        assert_eq!(channel.shutdowns, 0);
        assert!(channel.written.is_empty());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err(),
            "service must not be dialed for an unauthorized peer"
        );
    }

    #[tokio::test]
    async fn test_partial_reply_write_resets_once() {
        let (port, _service) = spawn_service(b"PONG").await;
        let agent = agent_for(port);
        let mut channel = ScriptedChannel::framed(peer("connector"), b"PING");
        channel.write_limit = Some(3);

        let err = agent.handle_channel(&mut channel).await.unwrap_err();

        assert!(matches!(
            err,
            AgentError::Reply(CodecError::PartialWrite {
                written: 3,
                expected: 6
            })
        ));
        assert_eq!(channel.resets, 1);
        assert_eq!(channel.shutdowns, 0);
    }

    #[tokio::test]
    async fn test_empty_channel_is_not_an_error() {
        let agent = agent_for(1);
        let mut channel = ScriptedChannel::new(peer("connector"), Vec::new());

        let outcome = agent.handle_channel(&mut channel).await.unwrap();

        assert_eq!(outcome, SessionOutcome::Empty);
        assert_eq!(channel.shutdowns, 1);
        assert_eq!(channel.resets, 0);
    }

    #[tokio::test]
    async fn test_truncated_request_resets() {
        let agent = agent_for(1);
        let mut channel = ScriptedChannel::new(peer("connector"), vec![0x0a, 0x00, b'h', b'i']);

        let err = agent.handle_channel(&mut channel).await.unwrap_err();

        assert!(matches!(
            err,
            AgentError::Request(CodecError::Truncated { .. })
        ));
        assert_eq!(channel.resets, 1);
        assert_eq!(channel.shutdowns, 0);
    }

    #[tokio::test]
    async fn test_service_down_resets() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let agent = agent_for(port);
        let mut channel = ScriptedChannel::framed(peer("connector"), b"PING");

        let err = agent.handle_channel(&mut channel).await.unwrap_err();

        assert!(matches!(err, AgentError::ConnectionFailed { .. }));
        assert_eq!(channel.resets, 1);
        assert!(channel.written.is_empty());
    }

    #[tokio::test]
    async fn test_large_reply_is_split_into_frames() {
        static BIG: [u8; 70_000] = [b'x'; 70_000];
        let (port, _service) = spawn_service(&BIG).await;
        let agent = agent_for(port);
        let mut channel = ScriptedChannel::framed(peer("connector"), b"GET");

        let outcome = agent.handle_channel(&mut channel).await.unwrap();

        let SessionOutcome::Forwarded { reply_bytes, .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        // Frames carry whatever each read returned; every byte relayed is framed
        assert!(reply_bytes > 0 && reply_bytes <= BIG.len());
        let mut cursor = Cursor::new(channel.written.clone());
        let mut relayed = 0;
        while let Some(frame) = read_message(&mut cursor).await.unwrap() {
            relayed += frame.len();
        }
        assert_eq!(relayed, reply_bytes);
    }
}
