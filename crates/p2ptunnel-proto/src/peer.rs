//! Peer identity
//!
//! A peer is identified by the SHA-256 fingerprint of its node certificate,
//! rendered as 64 lowercase hex characters. The forwarding core only stores and
//! compares identities; deriving them is left to the network provider.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a peer ID
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Invalid peer ID length: expected {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid character {0:?} in peer ID")]
    InvalidCharacter(char),
}

/// Opaque, comparable peer identity
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Length of the textual form
    pub const ENCODED_LEN: usize = 64;

    /// Derive the identity of whoever holds `material` (a DER certificate in practice)
    pub fn fingerprint(material: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(material)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != Self::ENCODED_LEN {
            return Err(PeerIdError::InvalidLength {
                expected: Self::ENCODED_LEN,
                actual: s.len(),
            });
        }

        if let Some(bad) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(PeerIdError::InvalidCharacter(bad));
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
