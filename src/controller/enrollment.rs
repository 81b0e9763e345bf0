//! Enrollment and renewal RPC handlers.
//!
//! Bootstrap enrollment authenticates with a one-time token and mints the
//! workload's first certificate; renewal authenticates with the current mTLS
//! identity and binds the new certificate to the same SPIFFE id. Private
//! keys stay with the workload; only PKIX public keys travel here.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::config;
use crate::control::AllowlistEntry;
use crate::controller::auth::peer_identity;
use crate::controller::registry::{ConnectorRecord, TunnelerRecord};
use crate::controller::ControllerState;
use crate::errors::{AuthErrorType, Error, Result};
use crate::identity::{validate_workload_id, SpiffeId, WorkloadRole};
use crate::proto::v1::enrollment_service_server::EnrollmentService;
use crate::proto::v1::{EnrollRequest, EnrollResponse};

pub struct EnrollmentApi {
    state: Arc<ControllerState>,
}

impl EnrollmentApi {
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }

    fn validate_common(&self, req: &EnrollRequest) -> Result<()> {
        validate_workload_id(&req.id)?;
        if req.public_key.trim().is_empty() {
            return Err(Error::validation_field("public key must not be empty", "public_key"));
        }
        Ok(())
    }

    fn issue(
        &self,
        spiffe: &SpiffeId,
        public_key_pem: &str,
        ttl: std::time::Duration,
        ip_sans: &[IpAddr],
    ) -> Result<EnrollResponse> {
        let certificate = self.state.ca.issue_workload_cert(
            &spiffe.uri(),
            public_key_pem,
            ttl,
            &[],
            ip_sans,
        )?;
        Ok(EnrollResponse { certificate, ca_certificate: self.state.ca.cert_pem().to_string() })
    }
}

/// Parse an advertised private address. Invalid input downgrades to "no IP
/// SAN" rather than failing the enrollment.
fn parse_ip_san(private_ip: &str) -> Vec<IpAddr> {
    match private_ip.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            debug!(private_ip, "advertised address is not a valid IP, omitting IP SAN");
            Vec::new()
        }
    }
}

#[tonic::async_trait]
impl EnrollmentService for EnrollmentApi {
    async fn enroll_connector(
        &self,
        request: Request<EnrollRequest>,
    ) -> std::result::Result<Response<EnrollResponse>, Status> {
        let req = request.into_inner();
        self.validate_common(&req)?;
        if req.private_ip.trim().is_empty() {
            return Err(Error::validation_field("private_ip must not be empty", "private_ip").into());
        }
        if req.version.trim().is_empty() {
            return Err(Error::validation_field("version must not be empty", "version").into());
        }

        self.state.token_store()?.consume(&req.token, &req.id)?;

        let spiffe = SpiffeId::new(
            self.state.trust_domain.clone(),
            WorkloadRole::Connector,
            &req.id,
        )?;
        let response =
            self.issue(&spiffe, &req.public_key, self.state.connector_cert_ttl, &parse_ip_san(&req.private_ip))?;

        self.state.connectors.upsert(ConnectorRecord {
            id: req.id.clone(),
            private_ip: req.private_ip.clone(),
            version: req.version.clone(),
            last_seen: Utc::now(),
        });

        info!(
            role = "connector",
            id = %req.id,
            private_ip = %req.private_ip,
            version = %req.version,
            "workload enrolled"
        );
        Ok(Response::new(response))
    }

    async fn enroll_tunneler(
        &self,
        request: Request<EnrollRequest>,
    ) -> std::result::Result<Response<EnrollResponse>, Status> {
        let req = request.into_inner();
        self.validate_common(&req)?;

        self.state.token_store()?.consume(&req.token, &req.id)?;

        let spiffe =
            SpiffeId::new(self.state.trust_domain.clone(), WorkloadRole::Tunneler, &req.id)?;
        let response =
            self.issue(&spiffe, &req.public_key, config::TUNNELER_CERT_TTL, &[])?;

        self.state.tunnelers.upsert(TunnelerRecord {
            id: req.id.clone(),
            spiffe_id: spiffe.uri(),
            connector_id: String::new(),
            last_seen: Utc::now(),
        });

        // Announce the new identity so connectors admit its handshake.
        self.state.allowlist.publish(AllowlistEntry {
            tunneler_id: req.id.clone(),
            spiffe_id: spiffe.uri(),
        });

        info!(role = "tunneler", id = %req.id, "workload enrolled");
        Ok(Response::new(response))
    }

    async fn renew(
        &self,
        request: Request<EnrollRequest>,
    ) -> std::result::Result<Response<EnrollResponse>, Status> {
        let peer = peer_identity(&request)?;
        let req = request.into_inner();
        self.validate_common(&req)?;

        if peer.spiffe.id != req.id {
            return Err(Error::auth(
                format!(
                    "peer '{}' may not renew certificate for '{}'",
                    peer.spiffe, req.id
                ),
                AuthErrorType::IdentityMismatch,
            )
            .into());
        }

        let (ttl, ip_sans) = match peer.spiffe.role {
            WorkloadRole::Connector => {
                let ips = self
                    .state
                    .connectors
                    .get(&req.id)
                    .map(|record| parse_ip_san(&record.private_ip))
                    .unwrap_or_default();
                (self.state.connector_cert_ttl, ips)
            }
            WorkloadRole::Tunneler => (config::TUNNELER_CERT_TTL, Vec::new()),
            WorkloadRole::Controller => {
                return Err(Error::auth(
                    "controller certificates are not renewed over RPC",
                    AuthErrorType::RoleNotAllowed,
                )
                .into());
            }
        };

        let response = self.issue(&peer.spiffe, &req.public_key, ttl, &ip_sans)?;
        debug!(spiffe_id = %peer.spiffe, serial = %peer.serial, "workload certificate renewed");
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::auth::PeerIdentity;
    use crate::controller::test_support::test_state;
    use crate::identity::ca::generate_key_pair;
    use crate::identity::leaf::ParsedLeaf;

    fn enroll_request(id: &str, token: &str, private_ip: &str, version: &str) -> EnrollRequest {
        let key = generate_key_pair().unwrap();
        EnrollRequest {
            id: id.to_string(),
            public_key: key.public_key_pem(),
            token: token.to_string(),
            private_ip: private_ip.to_string(),
            version: version.to_string(),
        }
    }

    fn renew_request_as(peer: &SpiffeId, id: &str) -> Request<EnrollRequest> {
        let mut request = Request::new(enroll_request(id, "", "", ""));
        request
            .extensions_mut()
            .insert(PeerIdentity { spiffe: peer.clone(), serial: "ab12".into() });
        request
    }

    #[tokio::test]
    async fn bootstrap_happy_path_issues_bound_leaf() {
        let state = test_state();
        let api = EnrollmentApi::new(state.clone());
        let (token, _) = state.token_store().unwrap().create().unwrap();

        let response = api
            .enroll_connector(Request::new(enroll_request("c1", &token, "10.0.0.5", "1.0")))
            .await
            .unwrap()
            .into_inner();

        let parsed = ParsedLeaf::from_pem(&response.certificate).unwrap();
        assert_eq!(parsed.spiffe_uri, "spiffe://mycorp.internal/connector/c1");
        assert_eq!(parsed.ip_sans, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert!(!response.ca_certificate.is_empty());

        let record = state.connectors.get("c1").unwrap();
        assert_eq!(record.private_ip, "10.0.0.5");
        assert_eq!(record.version, "1.0");
    }

    #[tokio::test]
    async fn token_is_single_use_across_ids() {
        let state = test_state();
        let api = EnrollmentApi::new(state.clone());
        let (token, _) = state.token_store().unwrap().create().unwrap();

        api.enroll_connector(Request::new(enroll_request("c1", &token, "10.0.0.5", "1.0")))
            .await
            .unwrap();

        let status = api
            .enroll_connector(Request::new(enroll_request("c2", &token, "10.0.0.6", "1.0")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn invalid_private_ip_omits_ip_san() {
        let state = test_state();
        let api = EnrollmentApi::new(state.clone());
        let (token, _) = state.token_store().unwrap().create().unwrap();

        let response = api
            .enroll_connector(Request::new(enroll_request("c1", &token, "not-an-ip", "1.0")))
            .await
            .unwrap()
            .into_inner();

        let parsed = ParsedLeaf::from_pem(&response.certificate).unwrap();
        assert!(parsed.ip_sans.is_empty());
    }

    #[tokio::test]
    async fn structural_validation_is_invalid_argument() {
        let state = test_state();
        let api = EnrollmentApi::new(state);

        let status = api
            .enroll_connector(Request::new(enroll_request("bad id!", "tok", "10.0.0.5", "1.0")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let api = EnrollmentApi::new(test_state());
        let status = api
            .enroll_connector(Request::new(enroll_request("c1", "tok", "", "1.0")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn tunneler_enrollment_publishes_allowlist_delta() {
        let state = test_state();
        let api = EnrollmentApi::new(state.clone());
        let (token, _) = state.token_store().unwrap().create().unwrap();
        let mut deltas = state.allowlist.subscribe();

        api.enroll_tunneler(Request::new(enroll_request("t1", &token, "", "")))
            .await
            .unwrap();

        let delta = deltas.try_recv().unwrap();
        assert_eq!(delta.tunneler_id, "t1");
        assert_eq!(delta.spiffe_id, "spiffe://mycorp.internal/tunneler/t1");
        assert_eq!(state.allowlist.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn renew_requires_matching_identity() {
        let state = test_state();
        let api = EnrollmentApi::new(state.clone());
        let peer = SpiffeId::parse("spiffe://mycorp.internal/connector/c1").unwrap();

        let status = api.renew(renew_request_as(&peer, "c2")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let response = api.renew(renew_request_as(&peer, "c1")).await.unwrap().into_inner();
        let parsed = ParsedLeaf::from_pem(&response.certificate).unwrap();
        assert_eq!(parsed.spiffe_uri, peer.uri());
    }

    #[tokio::test]
    async fn renew_without_peer_identity_is_unauthenticated() {
        let state = test_state();
        let api = EnrollmentApi::new(state);
        let status = api
            .renew(Request::new(enroll_request("c1", "", "", "")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn connector_renewal_restores_registered_ip_san() {
        let state = test_state();
        let api = EnrollmentApi::new(state.clone());
        let (token, _) = state.token_store().unwrap().create().unwrap();

        api.enroll_connector(Request::new(enroll_request("c1", &token, "10.0.0.5", "1.0")))
            .await
            .unwrap();

        let peer = SpiffeId::parse("spiffe://mycorp.internal/connector/c1").unwrap();
        let response = api.renew(renew_request_as(&peer, "c1")).await.unwrap().into_inner();
        let parsed = ParsedLeaf::from_pem(&response.certificate).unwrap();
        assert_eq!(parsed.ip_sans, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    }
}
