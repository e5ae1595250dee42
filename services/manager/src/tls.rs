//! TLS material for the check-in transport.
//!
//! The manager mints an ephemeral CA at startup and issues a certificate per
//! worker instance from it. Workers verify the manager's server certificate
//! against the CA and present their client certificate back; the server
//! rejects any connection whose client certificate does not chain to the CA.
//! Certificates are never persisted; state is rederived on restart along
//! with everything else.

use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("tls configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Certificate material handed to one worker instance.
pub struct WorkerCredentials {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Ephemeral certificate authority owned by the manager.
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl CertificateAuthority {
    pub fn new() -> Result<Self, TlsError> {
        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "foreman manager ca");
        let ca_cert = params.self_signed(&ca_key)?;

        Ok(Self { ca_cert, ca_key })
    }

    /// DER encoding of the CA certificate, for worker connection blobs.
    pub fn ca_der(&self) -> Vec<u8> {
        self.ca_cert.der().to_vec()
    }

    /// Issue a client certificate for one worker instance. The common name
    /// carries the component id for the benefit of debugging tools.
    pub fn issue_worker(&self, component_id: &str) -> Result<WorkerCredentials, TlsError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, component_id);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        Ok(WorkerCredentials {
            cert_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        })
    }

    /// Server configuration for the check-in listener: CA-issued server
    /// certificate plus mandatory client-certificate verification.
    pub fn server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>, TlsError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![server_name.to_string()])?;
        params
            .distinguished_name
            .push(DnType::CommonName, "foreman manager");
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(self.ca_der()))?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                vec![CertificateDer::from(cert.der().to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )?;

        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_issues_distinct_worker_certs() {
        let authority = CertificateAuthority::new().unwrap();
        let a = authority.issue_worker("comp-a").unwrap();
        let b = authority.issue_worker("comp-b").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
        assert!(!a.key_der.is_empty());
    }

    #[test]
    fn server_config_builds() {
        foreman_wire::client::init_crypto_provider();
        let authority = CertificateAuthority::new().unwrap();
        let config = authority.server_config("localhost").unwrap();
        assert!(Arc::strong_count(&config) >= 1);
    }
}
