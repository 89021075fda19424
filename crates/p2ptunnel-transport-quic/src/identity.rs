//! Node identity: a self-signed certificate and its private key

use crate::SERVER_NAME;
use p2ptunnel_proto::PeerId;
use quinn::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),
}

/// Long-lived key material of one node
///
/// The PEM forms are what the configuration file stores; the DER forms feed
/// rustls directly.
pub struct NodeIdentity {
    certificate: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
    certificate_pem: String,
    private_key_pem: String,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Create a fresh identity with `name` as the certificate common name
    pub fn generate(name: &str) -> Result<Self, IdentityError> {
        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()])
            .map_err(|e| IdentityError::GenerationFailed(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;

        let key_pair =
            KeyPair::generate().map_err(|e| IdentityError::GenerationFailed(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| IdentityError::GenerationFailed(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// Load an identity from its PEM-encoded certificate and private key
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self, IdentityError> {
        let mut reader = certificate_pem.as_bytes();
        let certificate = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| IdentityError::InvalidCertificate("no certificate found".to_string()))?
            .map_err(|e| IdentityError::InvalidCertificate(e.to_string()))?;

        let mut reader = private_key_pem.as_bytes();
        let private_key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?
            .ok_or_else(|| IdentityError::InvalidKey("no private key found".to_string()))?;

        let peer_id = PeerId::fingerprint(certificate.as_ref());

        Ok(Self {
            certificate,
            private_key,
            certificate_pem: certificate_pem.to_string(),
            private_key_pem: private_key_pem.to_string(),
            peer_id,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub(crate) fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.certificate.clone()]
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }
}

impl Clone for NodeIdentity {
    fn clone(&self) -> Self {
        Self {
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone_key(),
            certificate_pem: self.certificate_pem.clone(),
            private_key_pem: self.private_key_pem.clone(),
            peer_id: self.peer_id.clone(),
        }
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_reload() {
        let identity = NodeIdentity::generate("agent").unwrap();
        assert_eq!(identity.peer_id().as_str().len(), PeerId::ENCODED_LEN);
        assert!(identity.certificate_pem().contains("BEGIN CERTIFICATE"));
        assert!(identity.private_key_pem().contains("PRIVATE KEY"));

        let reloaded =
            NodeIdentity::from_pem(identity.certificate_pem(), identity.private_key_pem()).unwrap();
        assert_eq!(reloaded.peer_id(), identity.peer_id());
    }

    #[test]
    fn test_distinct_identities() {
        let a = NodeIdentity::generate("a").unwrap();
        let b = NodeIdentity::generate("b").unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_rejects_garbage() {
        let identity = NodeIdentity::generate("agent").unwrap();

        let err = NodeIdentity::from_pem("not a certificate", identity.private_key_pem())
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCertificate(_)));

        let err = NodeIdentity::from_pem(identity.certificate_pem(), "").unwrap_err();
        assert!(matches!(err, IdentityError::InvalidKey(_)));
    }

    #[test]
    fn test_debug_hides_key() {
        let identity = NodeIdentity::generate("agent").unwrap();
        let debug = format!("{:?}", identity);
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
