//! TLS policy for the control plane.
//!
//! All listeners and dials are TLS 1.3 with ALPN `h2`. rustls is configured
//! directly so that:
//!
//! - certificates come from the rotating [`CertificateStore`] at handshake
//!   time (hot renewal without listener restarts),
//! - the controller can accept enrollment calls without a client certificate
//!   (`VerifyClientCertIfGiven`) while the connector inbound listener
//!   requires one (`RequireAndVerifyClientCert`),
//! - clients verify the dialed peer's SPIFFE identity against the pinned
//!   internal CA instead of a hostname.

pub mod connect;
pub mod incoming;
pub mod verify;

pub use connect::connect_channel;
pub use incoming::{serve_tls_incoming, TlsConnectInfo};
pub use verify::SpiffeServerVerifier;

use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::errors::{Error, Result};
use crate::identity::{CertificateStore, SpiffeId, TrustDomain, WorkloadRole};

/// Client-certificate policy for a TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthPolicy {
    /// Verify a client certificate when one is presented, but allow
    /// anonymous connections. Per-method enforcement happens in the
    /// authentication layer. Used by the controller so bootstrap enrollment
    /// can run with only the pinned CA.
    VerifyIfGiven,
    /// Require and verify a client certificate during the handshake. Used by
    /// the connector inbound listener.
    Required,
}

/// Build a root pool from a CA bundle PEM.
pub fn build_root_store(ca_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let certs = CertificateDer::pem_slice_iter(ca_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::certificate(format!("invalid CA bundle PEM: {:?}", e)))?;

    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::certificate("CA bundle contains no usable certificates"));
    }
    Ok(roots)
}

/// Server-side rustls configuration backed by the rotating store.
pub fn server_config(
    store: Arc<CertificateStore>,
    client_ca_pem: &str,
    policy: ClientAuthPolicy,
) -> Result<Arc<ServerConfig>> {
    let roots = Arc::new(build_root_store(client_ca_pem)?);

    let builder = WebPkiClientVerifier::builder(roots);
    let verifier = match policy {
        ClientAuthPolicy::VerifyIfGiven => builder.allow_unauthenticated().build(),
        ClientAuthPolicy::Required => builder.build(),
    }
    .map_err(|e| Error::tls(format!("failed to build client verifier: {}", e)))?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(store);
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Client-side rustls configuration that authenticates with the rotating
/// store and verifies the dialed peer's SPIFFE identity.
pub fn client_config(
    store: Arc<CertificateStore>,
    ca_pem: &str,
    trust_domain: &TrustDomain,
    expected_role: WorkloadRole,
) -> Result<Arc<ClientConfig>> {
    let verifier = SpiffeServerVerifier::new(ca_pem, trust_domain.clone(), expected_role)?;
    let mut config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_cert_resolver(store);
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Client-side configuration for bootstrap enrollment: the caller holds only
/// the pinned CA and presents no client certificate.
pub fn bootstrap_client_config(
    ca_pem: &str,
    trust_domain: &TrustDomain,
) -> Result<Arc<ClientConfig>> {
    let verifier =
        SpiffeServerVerifier::new(ca_pem, trust_domain.clone(), WorkloadRole::Controller)?;
    let mut config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Identity checks shared by the verifier and the auth layer: the URI must
/// parse, sit in the expected trust domain, and carry the expected role.
pub(crate) fn check_peer_identity(
    uri: &str,
    trust_domain: &TrustDomain,
    expected_role: WorkloadRole,
) -> Result<SpiffeId> {
    let spiffe = SpiffeId::parse(uri)?;
    if &spiffe.trust_domain != trust_domain {
        return Err(Error::auth(
            format!(
                "peer trust domain '{}' does not match '{}'",
                spiffe.trust_domain, trust_domain
            ),
            crate::errors::AuthErrorType::WrongTrustDomain,
        ));
    }
    if spiffe.role != expected_role {
        return Err(Error::auth(
            format!("peer role '{}' is not '{}'", spiffe.role, expected_role),
            crate::errors::AuthErrorType::RoleNotAllowed,
        ));
    }
    Ok(spiffe)
}
