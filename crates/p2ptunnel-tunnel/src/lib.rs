//! Tunnel forwarding core
//!
//! Relays request/reply exchanges between a local TCP endpoint and one remote
//! peer, in one of two roles:
//!
//! ```text
//! TCP client ─► Connector ══ framed channel ══► Agent ─► TCP service
//!            ◄─           ◄══════════════════        ◄─
//! ```
//!
//! - [`Agent`] answers inbound channels from authorized peers by dialing the
//!   local service once per exchange.
//! - [`Connector`] listens on a local port and opens one channel to the
//!   selected peer per accepted connection, waiting out unreachable peers.
//! - [`Discovery`] keeps peers connected and reports when they become ready.
//!
//! Every component is generic over [`p2ptunnel_transport::PeerNetwork`], so the
//! same code runs over QUIC in production and over the in-memory hub in tests.

pub mod agent;
pub mod connector;
pub mod discovery;
pub mod httplog;
pub mod registry;
pub mod retry;
pub mod selector;

pub use agent::{Agent, AgentConfig, AgentError, SessionOutcome};
pub use connector::{Connector, ConnectorConfig, ConnectorError, ExchangeStats, DEFAULT_CONNECTOR_PORT};
pub use discovery::{Discovery, DiscoveryConfig, ReadinessReport};
pub use httplog::{HeaderCapture, HttpHeaderTap};
pub use registry::{PeerRegistry, RegistryEntry, RegistryError};
pub use retry::{RetryPolicy, DEFAULT_RETRY_DELAY};
pub use selector::{PeerSelector, SelectorError, SinglePeerSelector};
