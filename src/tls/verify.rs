//! SPIFFE-aware server certificate verification.
//!
//! Workload certificates carry no meaningful hostnames (a controller is
//! reachable on whatever address the operator wired up), so clients verify
//! the chain against the pinned internal CA and then check the peer's SPIFFE
//! URI instead of the SNI name. Chain building, validity windows, and
//! signatures are delegated to the webpki machinery.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::errors::Result;
use crate::identity::{leaf, TrustDomain, WorkloadRole};

/// Verifies the peer chains to the pinned internal CA and presents the
/// expected SPIFFE role within the expected trust domain.
#[derive(Debug)]
pub struct SpiffeServerVerifier {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
    trust_domain: TrustDomain,
    expected_role: WorkloadRole,
}

impl SpiffeServerVerifier {
    pub fn new(
        ca_pem: &str,
        trust_domain: TrustDomain,
        expected_role: WorkloadRole,
    ) -> Result<Self> {
        Ok(Self {
            roots: super::build_root_store(ca_pem)?,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            trust_domain,
            expected_role,
        })
    }

    fn check_spiffe_identity(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let uri = leaf::spiffe_uri_from_der(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(e.to_string()))?
            .ok_or_else(|| {
                rustls::Error::General("peer certificate carries no spiffe URI SAN".to_string())
            })?;

        super::check_peer_identity(&uri, &self.trust_domain, self.expected_role)
            .map(|_| ())
            .map_err(|e| rustls::Error::General(e.to_string()))
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        // Identity lives in the URI SAN, not in the dialed name.
        self.check_spiffe_identity(end_entity)?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
