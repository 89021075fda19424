//! Tunnel Protocol Definitions
//!
//! This crate defines the peer identity type, the protocol identifier and the
//! length-prefixed framing shared by the agent and connector roles.

pub mod codec;
pub mod peer;

pub use codec::{read_message, write_full, write_message, CodecError, TunnelCodec};
pub use peer::{PeerId, PeerIdError};

/// Protocol identifier used to multiplex tunnel traffic over the peer network
pub const PROTOCOL: &str = "/p2ptunnel/0.0.1";

/// Size of the little-endian length prefix in front of every tunnel message
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Maximum payload carried by a single tunnel message
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;
