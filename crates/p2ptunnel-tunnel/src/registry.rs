//! Peer registry and authorization
//!
//! Built once at startup from the configuration and shared read-only between
//! every session. The reverse map (identity to name) is the only source of
//! truth for deciding whether an inbound channel may be served.

use p2ptunnel_proto::PeerId;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer name {0:?} is configured more than once")]
    DuplicateName(String),

    #[error("Peer {id} is configured as both {first:?} and {second:?}")]
    DuplicateIdentity {
        id: PeerId,
        first: String,
        second: String,
    },
}

/// One configured peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub name: String,
    pub id: PeerId,
}

/// Immutable name/identity table
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    entries: Vec<RegistryEntry>,
    by_id: HashMap<PeerId, usize>,
}

impl PeerRegistry {
    pub fn new<I>(peers: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (String, PeerId)>,
    {
        let mut registry = Self::default();

        for (name, id) in peers {
            if registry.get(&name).is_some() {
                return Err(RegistryError::DuplicateName(name));
            }

            if let Some(first) = registry.name_of(&id) {
                return Err(RegistryError::DuplicateIdentity {
                    first: first.to_string(),
                    id,
                    second: name,
                });
            }

            registry.by_id.insert(id.clone(), registry.entries.len());
            registry.entries.push(RegistryEntry { name, id });
        }

        Ok(registry)
    }

    /// Whether `peer` may open tunnel channels to this node
    pub fn authorize(&self, peer: &PeerId) -> bool {
        self.by_id.contains_key(peer)
    }

    /// Reverse lookup
    pub fn name_of(&self, peer: &PeerId) -> Option<&str> {
        self.by_id
            .get(peer)
            .map(|&index| self.entries[index].name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: &str) -> PeerId {
        PeerId::fingerprint(seed.as_bytes())
    }

    #[test]
    fn test_authorize_and_reverse_lookup() {
        let registry = PeerRegistry::new([
            ("office".to_string(), id("office")),
            ("laptop".to_string(), id("laptop")),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.authorize(&id("office")));
        assert_eq!(registry.name_of(&id("laptop")), Some("laptop"));
        assert_eq!(registry.get("office").map(|e| &e.id), Some(&id("office")));

        assert!(!registry.authorize(&id("stranger")));
        assert_eq!(registry.name_of(&id("stranger")), None);
    }

    #[test]
    fn test_empty_registry_rejects_everyone() {
        let registry = PeerRegistry::new(Vec::new()).unwrap();
        assert!(registry.is_empty());
        assert!(!registry.authorize(&id("anyone")));
    }

    #[test]
    fn test_duplicate_name() {
        let err = PeerRegistry::new([
            ("office".to_string(), id("a")),
            ("office".to_string(), id("b")),
        ])
        .unwrap_err();

        assert_eq!(err, RegistryError::DuplicateName("office".to_string()));
    }

    #[test]
    fn test_duplicate_identity() {
        let err = PeerRegistry::new([
            ("office".to_string(), id("a")),
            ("laptop".to_string(), id("a")),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::DuplicateIdentity { ref first, ref second, .. }
                if first == "office" && second == "laptop"
        ));
    }
}
