//! Peer authentication for gRPC listeners.
//!
//! Every inbound RPC passes through [`AuthLayer`], a Tower middleware that
//! reads the peer's TLS session from request extensions, validates the
//! SPIFFE identity (trust domain, role set, optional allowlist), and
//! publishes the verified [`PeerIdentity`] for handlers. Enrollment methods
//! are exempt at the mTLS layer; they authorize with a bootstrap token
//! inside the handler instead.
//!
//! Rejections are emitted as gRPC trailers-only responses so no handler ever
//! observes an unauthenticated request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::HeaderValue;
use http::{Request, Response};
use tonic::Status;
use tower::{Layer, Service};
use tracing::warn;

use crate::errors::{AuthErrorType, Error, Result};
use crate::identity::{leaf, SpiffeId, TrustDomain, WorkloadRole};
use crate::tls::TlsConnectInfo;

/// Methods that bypass peer-certificate checks; they carry a one-time
/// bootstrap token instead.
pub const UNAUTHENTICATED_METHODS: &[&str] = &[
    "/trustplane.v1.EnrollmentService/EnrollConnector",
    "/trustplane.v1.EnrollmentService/EnrollTunneler",
];

/// Verified peer identity, published into request extensions.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub spiffe: SpiffeId,
    /// Certificate serial, lowercase hex, for audit logging.
    pub serial: String,
}

/// Connector-side hook: admit only allowlisted tunneler identities.
pub trait PeerAllowlist: Send + Sync + std::fmt::Debug {
    fn allows(&self, spiffe: &SpiffeId) -> bool;
}

/// Authentication rules for one listener.
#[derive(Debug)]
pub struct AuthPolicy {
    trust_domain: TrustDomain,
    /// Roles admitted by this listener. Empty means any known role.
    allowed_roles: Vec<WorkloadRole>,
    /// Method paths exempt from peer-certificate checks.
    unauthenticated_methods: &'static [&'static str],
    allowlist: Option<Arc<dyn PeerAllowlist>>,
}

impl AuthPolicy {
    /// Controller policy: connectors and tunnelers may call, enrollment
    /// methods are token-authenticated.
    pub fn controller(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            allowed_roles: vec![WorkloadRole::Connector, WorkloadRole::Tunneler],
            unauthenticated_methods: UNAUTHENTICATED_METHODS,
            allowlist: None,
        }
    }

    /// Connector inbound policy: only allowlisted tunnelers, no exemptions.
    pub fn connector_inbound(
        trust_domain: TrustDomain,
        allowlist: Arc<dyn PeerAllowlist>,
    ) -> Self {
        Self {
            trust_domain,
            allowed_roles: vec![WorkloadRole::Tunneler],
            unauthenticated_methods: &[],
            allowlist: Some(allowlist),
        }
    }

    fn is_unauthenticated_method(&self, path: &str) -> bool {
        self.unauthenticated_methods.contains(&path)
    }

    /// Run the full identity check against a connection's TLS state.
    pub fn authenticate(&self, conn: Option<&TlsConnectInfo>) -> Result<PeerIdentity> {
        let conn = conn.ok_or_else(|| {
            Error::auth("connection carries no TLS session info", AuthErrorType::MissingPeerCertificate)
        })?;

        let certs = conn
            .peer_certificates
            .as_ref()
            .filter(|certs| !certs.is_empty())
            .ok_or_else(|| {
                Error::auth("peer presented no client certificate", AuthErrorType::MissingPeerCertificate)
            })?;

        let leaf_der = certs[0].as_ref();
        let serial = leaf::serial_from_der(leaf_der).unwrap_or_default();
        let uri = leaf::spiffe_uri_from_der(leaf_der)?.ok_or_else(|| {
            Error::auth(
                "peer certificate carries no spiffe URI SAN",
                AuthErrorType::MissingPeerCertificate,
            )
        })?;

        let spiffe = SpiffeId::parse(&uri).map_err(|e| match e {
            Error::Auth { .. } => e,
            _ => Error::auth(
                format!("peer spiffe URI '{}' is malformed", uri),
                AuthErrorType::MalformedIdentity,
            ),
        })?;

        if spiffe.trust_domain != self.trust_domain {
            return Err(Error::auth(
                format!(
                    "peer trust domain '{}' does not match '{}'",
                    spiffe.trust_domain, self.trust_domain
                ),
                AuthErrorType::WrongTrustDomain,
            ));
        }

        if !self.allowed_roles.is_empty() && !self.allowed_roles.contains(&spiffe.role) {
            return Err(Error::auth(
                format!("role '{}' is not permitted on this listener", spiffe.role),
                AuthErrorType::RoleNotAllowed,
            ));
        }

        if let Some(allowlist) = &self.allowlist {
            if spiffe.role == WorkloadRole::Tunneler && !allowlist.allows(&spiffe) {
                return Err(Error::auth(
                    format!("tunneler '{}' is not allowlisted", spiffe),
                    AuthErrorType::NotAllowlisted,
                ));
            }
        }

        Ok(PeerIdentity { spiffe, serial })
    }
}

/// Tower layer installing [`AuthPolicy`] in front of every service.
#[derive(Clone)]
pub struct AuthLayer {
    policy: Arc<AuthPolicy>,
}

impl AuthLayer {
    pub fn new(policy: AuthPolicy) -> Self {
        Self { policy: Arc::new(policy) }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService { inner, policy: self.policy.clone() }
    }
}

/// Service wrapper enforcing the policy per request.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    policy: Arc<AuthPolicy>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AuthService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let path = request.uri().path().to_string();
        let mut inner = self.inner.clone();

        if self.policy.is_unauthenticated_method(&path) {
            return Box::pin(async move { inner.call(request).await });
        }

        let conn = request.extensions().get::<TlsConnectInfo>().cloned();
        match self.policy.authenticate(conn.as_ref()) {
            Ok(identity) => {
                request.extensions_mut().insert(identity);
                Box::pin(async move { inner.call(request).await })
            }
            Err(error) => {
                let spiffe = peer_spiffe_for_log(conn.as_ref());
                let serial = peer_serial_for_log(conn.as_ref());
                warn!(
                    method = %path,
                    spiffe_id = %spiffe,
                    serial = %serial,
                    error = %error,
                    "rejected unauthenticated peer"
                );
                let response = reject_response(Status::from(error));
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// Build a gRPC trailers-only response for a rejected request.
fn reject_response<ResBody: Default>(status: Status) -> Response<ResBody> {
    let mut response = Response::new(ResBody::default());
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert("content-type", HeaderValue::from_static("application/grpc"));
    headers.insert(
        "grpc-status",
        HeaderValue::from_str(&(status.code() as i32).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("2")),
    );
    if let Ok(message) = HeaderValue::from_str(status.message()) {
        headers.insert("grpc-message", message);
    }
    response
}

fn peer_spiffe_for_log(conn: Option<&TlsConnectInfo>) -> String {
    conn.and_then(|c| c.peer_certificates.as_ref())
        .and_then(|certs| certs.first())
        .and_then(|cert| leaf::spiffe_uri_from_der(cert.as_ref()).ok().flatten())
        .unwrap_or_else(|| "<none>".to_string())
}

fn peer_serial_for_log(conn: Option<&TlsConnectInfo>) -> String {
    conn.and_then(|c| c.peer_certificates.as_ref())
        .and_then(|certs| certs.first())
        .and_then(|cert| leaf::serial_from_der(cert.as_ref()))
        .unwrap_or_else(|| "<none>".to_string())
}

/// Fetch the verified peer identity published by [`AuthLayer`].
pub fn peer_identity<T>(request: &tonic::Request<T>) -> Result<PeerIdentity> {
    request.extensions().get::<PeerIdentity>().cloned().ok_or_else(|| {
        Error::auth("request carries no verified peer identity", AuthErrorType::MissingPeerCertificate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ca::{generate_key_pair, CertificateAuthority};
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::CertificateDer;
    use std::net::SocketAddr;
    use std::time::Duration;

    #[derive(Debug)]
    struct StaticAllowlist(Vec<String>);

    impl PeerAllowlist for StaticAllowlist {
        fn allows(&self, spiffe: &SpiffeId) -> bool {
            self.0.contains(&spiffe.uri())
        }
    }

    fn conn_info(certs: Option<Vec<CertificateDer<'static>>>) -> TlsConnectInfo {
        TlsConnectInfo {
            remote_addr: "127.0.0.1:50000".parse::<SocketAddr>().unwrap(),
            peer_certificates: certs.map(Arc::new),
        }
    }

    fn issue(ca: &CertificateAuthority, uri: &str) -> CertificateDer<'static> {
        let key = generate_key_pair().unwrap();
        let pem = ca
            .issue_workload_cert(uri, &key.public_key_pem(), Duration::from_secs(600), &[], &[])
            .unwrap();
        CertificateDer::from_pem_slice(pem.as_bytes()).unwrap()
    }

    fn test_ca() -> CertificateAuthority {
        let (cert, key) =
            CertificateAuthority::generate_self_signed("auth test ca", Duration::from_secs(3600))
                .unwrap();
        CertificateAuthority::load(&cert, &key).unwrap()
    }

    fn controller_policy() -> AuthPolicy {
        AuthPolicy::controller(TrustDomain::parse("mycorp.internal").unwrap())
    }

    #[test]
    fn enrollment_methods_are_exempt() {
        let policy = controller_policy();
        assert!(policy.is_unauthenticated_method("/trustplane.v1.EnrollmentService/EnrollConnector"));
        assert!(policy.is_unauthenticated_method("/trustplane.v1.EnrollmentService/EnrollTunneler"));
        assert!(!policy.is_unauthenticated_method("/trustplane.v1.EnrollmentService/Renew"));
        assert!(!policy.is_unauthenticated_method("/trustplane.v1.ControlPlane/Connect"));
    }

    #[test]
    fn accepts_fleet_roles_and_publishes_identity() {
        let ca = test_ca();
        let policy = controller_policy();

        let conn = conn_info(Some(vec![issue(&ca, "spiffe://mycorp.internal/connector/c1")]));
        let identity = policy.authenticate(Some(&conn)).unwrap();
        assert_eq!(identity.spiffe.uri(), "spiffe://mycorp.internal/connector/c1");
        assert!(!identity.serial.is_empty());
    }

    #[test]
    fn rejects_missing_certificate_as_unauthenticated() {
        let policy = controller_policy();
        let err = policy.authenticate(Some(&conn_info(None))).unwrap_err();
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::Unauthenticated);

        let err = policy.authenticate(None).unwrap_err();
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn rejects_wrong_trust_domain_as_permission_denied() {
        let ca = test_ca();
        let policy = controller_policy();
        let conn = conn_info(Some(vec![issue(&ca, "spiffe://other.internal/connector/c1")]));
        let err = policy.authenticate(Some(&conn)).unwrap_err();
        assert_eq!(tonic::Status::from(err).code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn rejects_controller_role_on_controller_listener() {
        let ca = test_ca();
        let policy = controller_policy();
        let conn =
            conn_info(Some(vec![issue(&ca, "spiffe://mycorp.internal/controller/controller")]));
        let err = policy.authenticate(Some(&conn)).unwrap_err();
        assert!(matches!(
            err,
            Error::Auth { error_type: AuthErrorType::RoleNotAllowed, .. }
        ));
    }

    #[test]
    fn connector_policy_enforces_allowlist() {
        let ca = test_ca();
        let allowlist = Arc::new(StaticAllowlist(vec![
            "spiffe://mycorp.internal/tunneler/t1".to_string(),
        ]));
        let policy = AuthPolicy::connector_inbound(
            TrustDomain::parse("mycorp.internal").unwrap(),
            allowlist,
        );

        let allowed = conn_info(Some(vec![issue(&ca, "spiffe://mycorp.internal/tunneler/t1")]));
        assert!(policy.authenticate(Some(&allowed)).is_ok());

        let denied = conn_info(Some(vec![issue(&ca, "spiffe://mycorp.internal/tunneler/t2")]));
        let err = policy.authenticate(Some(&denied)).unwrap_err();
        assert!(matches!(err, Error::Auth { error_type: AuthErrorType::NotAllowlisted, .. }));

        // Connectors are not admitted by the inbound listener at all.
        let connector = conn_info(Some(vec![issue(&ca, "spiffe://mycorp.internal/connector/c1")]));
        assert!(policy.authenticate(Some(&connector)).is_err());
    }

    #[test]
    fn reject_response_is_trailers_only_grpc() {
        let response: Response<String> =
            reject_response(Status::permission_denied("no"));
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/grpc");
        assert_eq!(response.headers()["grpc-status"], "7");
    }
}
