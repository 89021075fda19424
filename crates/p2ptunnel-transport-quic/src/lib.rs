//! QUIC peer network using quinn
//!
//! Every node runs a single quinn endpoint that both accepts and dials. Both
//! sides of a connection present a self-signed node certificate; a peer's
//! identity is the SHA-256 fingerprint of that certificate, so the dialer pins
//! the fingerprint it expects and the acceptor learns who called from the
//! handshake alone.
//!
//! Each channel is one bidirectional QUIC stream. The opener writes a short
//! header naming the protocol, the acceptor answers with a single status byte
//! and hands the stream to the handler registered for that protocol.
//!
//! ```text
//! opener                               acceptor
//!   │  [len: u8][protocol tag]  ──────►  │  lookup handler
//!   │  ◄──────  [status: u8]             │
//!   │  ◄═══════ application bytes ═════► │
//! ```
//!
//! # Example
//!
//! ```no_run
//! use p2ptunnel_transport::PeerNetwork;
//! use p2ptunnel_transport_quic::{NodeIdentity, QuicConfig, QuicNetwork};
//!
//! # async fn example(remote: p2ptunnel_proto::PeerId) -> Result<(), Box<dyn std::error::Error>> {
//! let identity = NodeIdentity::generate("agent")?;
//! let network = QuicNetwork::bind(identity, QuicConfig::default())?;
//! network.add_address(remote.clone(), "192.0.2.10:7101");
//! network.resolve_and_connect(&remote).await?;
//! # Ok(())
//! # }
//! ```

// Initialize rustls crypto provider once globally
// This MUST be called before any rustls/QUIC operations
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            // Provider already installed by another crate, this is fine
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod channel;
pub mod config;
pub mod identity;
pub mod network;
mod verifier;

pub use channel::QuicChannel;
pub use config::QuicConfig;
pub use identity::{IdentityError, NodeIdentity};
pub use network::QuicNetwork;

/// ALPN token negotiated on every connection
pub const ALPN: &[u8] = b"p2ptunnel/1";

/// TLS server name used for every dial; identity is checked by fingerprint instead
pub(crate) const SERVER_NAME: &str = "p2ptunnel";
