//! Choice of remote peer for outbound exchanges

use crate::registry::{PeerRegistry, RegistryEntry};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("No peer configured; add one before starting the connector")]
    NoPeers,

    #[error("{0} peers configured; the connector supports exactly one")]
    TooManyPeers(usize),
}

/// Picks the peer that receives the next exchange
pub trait PeerSelector: Send + Sync + Debug {
    fn select(&self) -> &RegistryEntry;
}

/// Always the one configured peer
#[derive(Debug, Clone)]
pub struct SinglePeerSelector {
    peer: RegistryEntry,
}

impl SinglePeerSelector {
    pub fn new(peer: RegistryEntry) -> Self {
        Self { peer }
    }

    /// Fails unless the registry holds exactly one peer
    pub fn from_registry(registry: &PeerRegistry) -> Result<Self, SelectorError> {
        match registry.entries() {
            [] => Err(SelectorError::NoPeers),
            [peer] => Ok(Self::new(peer.clone())),
            entries => Err(SelectorError::TooManyPeers(entries.len())),
        }
    }
}

impl PeerSelector for SinglePeerSelector {
    fn select(&self) -> &RegistryEntry {
        &self.peer
    }
}
