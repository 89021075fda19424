//! Peer network abstraction layer
//!
//! The forwarding core never talks to a concrete peer-to-peer stack. It sees a
//! [`PeerNetwork`] that can open a reliable byte channel to a peer under a
//! protocol tag, dispatch inbound channels to a registered handler, and report
//! whether a peer is currently connected.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Tunnel Forwarding Core                  │
//! │          (agent, connector, discovery loops)             │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │          p2ptunnel-transport (this crate)                │
//! │  - PeerNetwork          - PeerChannel                    │
//! │  - NetworkError/ErrorKind                                │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌───────────────────────────┬─────────────────────────────┐
//! │ memory (in-process hub)   │ p2ptunnel-transport-quic    │
//! └───────────────────────────┴─────────────────────────────┘
//! ```

pub mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;
use p2ptunnel_proto::PeerId;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Coarse classification used by retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer cannot be reached right now; trying again later may succeed
    Unreachable,
    /// Anything else
    Fatal,
}

/// Peer network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer {0} unreachable: {1}")]
    Unreachable(PeerId, String),

    #[error("No addresses known for peer {0}")]
    NoAddress(PeerId),

    #[error("Protocol {0} not supported by peer")]
    ProtocolNotSupported(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Network closed")]
    Closed,
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Unreachable(..) | NetworkError::NoAddress(_) => ErrorKind::Unreachable,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        self.kind() == ErrorKind::Unreachable
    }
}

/// Result type for peer network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// A reliable, ordered, bidirectional byte channel to one remote peer
///
/// Graceful close is `AsyncWriteExt::shutdown`; [`PeerChannel::reset`] aborts
/// the channel so the remote side sees an error instead of a clean end.
pub trait PeerChannel: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static {
    /// Identity of the peer on the other end
    fn remote_peer(&self) -> &PeerId;

    /// Identifier unique within the local node, for log correlation
    fn channel_id(&self) -> u64;

    /// Abort the channel in both directions
    fn reset(&mut self);
}

/// Callback invoked once per inbound channel
///
/// Providers spawn each invocation on its own task, so handlers for distinct
/// channels run concurrently.
pub type InboundHandler<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`InboundHandler`]
pub fn inbound_handler<C, F, Fut>(f: F) -> InboundHandler<C>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |channel| -> BoxFuture<'static, ()> { Box::pin(f(channel)) })
}

/// A node on the peer network
#[async_trait]
pub trait PeerNetwork: Send + Sync + Debug + 'static {
    /// The channel type produced by this network
    type Channel: PeerChannel;

    /// Identity of the local node
    fn local_peer_id(&self) -> &PeerId;

    /// Open a new channel to `peer` under `protocol`
    async fn open_channel(&self, peer: &PeerId, protocol: &str) -> NetworkResult<Self::Channel>;

    /// Route inbound channels tagged with `protocol` to `handler`
    fn set_inbound_handler(&self, protocol: &str, handler: InboundHandler<Self::Channel>);

    /// Stop accepting inbound channels for `protocol`
    fn remove_inbound_handler(&self, protocol: &str);

    /// Locate `peer` and establish a connection without opening a channel
    async fn resolve_and_connect(&self, peer: &PeerId) -> NetworkResult<()>;

    /// Whether a live connection to `peer` currently exists
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Shut the node down
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let peer = PeerId::fingerprint(b"agent");

        assert_eq!(
            NetworkError::Unreachable(peer.clone(), "dial timed out".to_string()).kind(),
            ErrorKind::Unreachable
        );
        assert!(NetworkError::NoAddress(peer).is_unreachable());

        assert_eq!(
            NetworkError::ProtocolNotSupported("/other/1.0".to_string()).kind(),
            ErrorKind::Fatal
        );
        assert!(!NetworkError::TlsError("bad certificate".to_string()).is_unreachable());
        assert!(!NetworkError::Closed.is_unreachable());
    }

    #[test]
    fn test_error_display() {
        let peer = PeerId::fingerprint(b"agent");
        let err = NetworkError::NoAddress(peer.clone());
        assert!(err.to_string().contains("No addresses"));
        assert!(err.to_string().contains(peer.as_str()));

        let err = NetworkError::ConnectionError("refused".to_string());
        assert!(err.to_string().contains("Connection error"));
    }
}
