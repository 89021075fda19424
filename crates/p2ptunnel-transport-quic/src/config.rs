//! QUIC peer network configuration

use crate::identity::NodeIdentity;
use crate::verifier::{AnyPeerVerifier, PinnedPeerVerifier};
use crate::ALPN;
use p2ptunnel_proto::PeerId;
use p2ptunnel_transport::{NetworkError, NetworkResult};
use quinn::{IdleTimeout, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default UDP port for peer-to-peer traffic
pub const DEFAULT_P2P_PORT: u16 = 7101;

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Local UDP address of the endpoint
    pub bind_addr: SocketAddr,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Upper bound on a single dial, handshake included
    pub connect_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams per connection
    pub max_concurrent_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_concurrent_streams: 1000,
        }
    }
}

impl QuicConfig {
    /// Set the local bind address
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set custom dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn validate(&self) -> NetworkResult<()> {
        if self.keep_alive_interval.as_secs() == 0 {
            return Err(NetworkError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(NetworkError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(NetworkError::ConfigurationError(
                "Connect timeout must be > 0".to_string(),
            ));
        }

        if self.max_concurrent_streams == 0 {
            return Err(NetworkError::ConfigurationError(
                "At least one concurrent stream is required".to_string(),
            ));
        }

        Ok(())
    }

    fn transport_config(&self) -> NetworkResult<quinn::TransportConfig> {
        let idle = IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            NetworkError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_streams));
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));

        Ok(transport)
    }

    /// Build quinn ServerConfig presenting `identity` and requiring a client certificate
    pub(crate) fn build_server_config(
        &self,
        identity: &NodeIdentity,
    ) -> NetworkResult<quinn::ServerConfig> {
        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_client_cert_verifier(AnyPeerVerifier::new())
            .with_single_cert(identity.cert_chain(), identity.private_key())
            .map_err(|e| NetworkError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| NetworkError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok(server_config)
    }

    /// Build quinn ClientConfig that only accepts `expected` on the other end
    pub(crate) fn build_client_config(
        &self,
        identity: &NodeIdentity,
        expected: &PeerId,
    ) -> NetworkResult<quinn::ClientConfig> {
        let mut client_crypto = quinn::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(PinnedPeerVerifier::new(expected.clone()))
            .with_client_auth_cert(identity.cert_chain(), identity.private_key())
            .map_err(|e| NetworkError::TlsError(format!("Invalid cert/key: {}", e)))?;

        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        // quinn expects owned ClientConfig, not Arc
        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| NetworkError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }
}
