//! Controller: internal CA, enrollment endpoints, control-plane server,
//! presence registries, token store, and the admin HTTP API.

pub mod admin;
pub mod allowlist;
pub mod auth;
pub mod control;
pub mod enrollment;
pub mod registry;
pub mod tokens;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::agent::renewal::next_renewal_at;
use crate::config::{self, ControllerConfig};
use crate::controller::allowlist::AllowlistHub;
use crate::controller::auth::{AuthLayer, AuthPolicy};
use crate::controller::registry::{ConnectorRegistry, TunnelerRegistry};
use crate::controller::tokens::{ConsumePolicy, TokenStore};
use crate::errors::{Error, Result};
use crate::identity::{CertificateAuthority, CertificateStore, SpiffeId, TrustDomain, WorkloadRole};
use crate::proto::v1::control_plane_server::ControlPlaneServer;
use crate::proto::v1::enrollment_service_server::EnrollmentServiceServer;
use crate::tls::{self, ClientAuthPolicy};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared controller state, reachable from every handler and the admin API.
pub struct ControllerState {
    pub trust_domain: TrustDomain,
    pub ca: CertificateAuthority,
    pub connectors: ConnectorRegistry,
    pub tunnelers: TunnelerRegistry,
    pub allowlist: AllowlistHub,
    tokens: Option<Arc<TokenStore>>,
    pub admin_token: String,
    pub internal_token: String,
    pub admin_bind_address: String,
    pub connector_cert_ttl: Duration,
    /// The controller's own serving identity, hot-swapped by local rotation.
    pub server_store: Arc<CertificateStore>,
    pub cancel: CancellationToken,
}

impl ControllerState {
    pub fn token_store(&self) -> Result<&TokenStore> {
        self.tokens
            .as_deref()
            .ok_or_else(|| Error::config("enrollment token service is not configured"))
    }
}

/// Bring up the controller and run until `cancel` fires.
pub async fn start_controller(config: ControllerConfig, cancel: CancellationToken) -> Result<()> {
    let ca = init_ca(&config)?;

    let server_store = Arc::new(CertificateStore::new());
    install_controller_cert(&ca, &config.trust_domain, &server_store)?;

    let token_store = Arc::new(TokenStore::new(
        if config.token_reuse { ConsumePolicy::ReusableWithinTtl } else { ConsumePolicy::SingleUse },
        config.token_ttl,
        config.token_store_path.clone(),
    )?);

    let state = Arc::new(ControllerState {
        trust_domain: config.trust_domain.clone(),
        ca,
        connectors: ConnectorRegistry::new(),
        tunnelers: TunnelerRegistry::new(),
        allowlist: AllowlistHub::new(),
        tokens: Some(token_store),
        admin_token: config.admin_token.clone(),
        internal_token: config.internal_token.clone(),
        admin_bind_address: config.admin_bind_address(),
        connector_cert_ttl: config.connector_cert_ttl,
        server_store: server_store.clone(),
        cancel: cancel.clone(),
    });

    // Admin HTTP API.
    let admin_state = state.clone();
    let admin_cancel = cancel.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin::start_admin_server(admin_state, admin_cancel.clone()).await {
            error!(error = %e, "admin API server failed");
            admin_cancel.cancel();
        }
    });

    // Local rotation of the controller's serving certificate.
    let rotation_state = state.clone();
    let rotation_cancel = cancel.clone();
    tokio::spawn(async move {
        rotate_controller_cert(rotation_state, rotation_cancel).await;
    });

    // gRPC listener with hot-reloadable TLS.
    let tls_config = tls::server_config(
        server_store,
        state.ca.cert_pem(),
        ClientAuthPolicy::VerifyIfGiven,
    )?;
    let grpc_addr = config.grpc_bind_address();
    let listener = TcpListener::bind(&grpc_addr)
        .await
        .map_err(|e| Error::transport(format!("failed to bind gRPC listener on {}: {}", grpc_addr, e)))?;
    let incoming = tls::serve_tls_incoming(listener, tls_config, cancel.clone());

    info!(
        address = %grpc_addr,
        trust_domain = %config.trust_domain,
        "controller gRPC server listening"
    );

    let auth_layer = AuthLayer::new(AuthPolicy::controller(config.trust_domain.clone()));
    let shutdown = cancel.clone();
    Server::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
        .tcp_keepalive(Some(KEEPALIVE_INTERVAL))
        .layer(auth_layer)
        .add_service(EnrollmentServiceServer::new(enrollment::EnrollmentApi::new(state.clone())))
        .add_service(ControlPlaneServer::new(control::ControlPlaneApi::new(state.clone())))
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::transport(format!("controller gRPC server failed: {}", e)))?;

    admin_task.abort();
    info!("controller shutdown completed");
    Ok(())
}

/// Load the CA from disk when configured, otherwise mint a fresh one. A
/// configured-but-absent location is first-boot: generate and persist.
fn init_ca(config: &ControllerConfig) -> Result<CertificateAuthority> {
    match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert_path), Some(key_path)) => {
            if cert_path.exists() && key_path.exists() {
                let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| Error::Io {
                    source: e,
                    context: format!("failed to read CA certificate '{}'", cert_path.display()),
                })?;
                let key_pem = std::fs::read_to_string(key_path).map_err(|e| Error::Io {
                    source: e,
                    context: format!("failed to read CA key '{}'", key_path.display()),
                })?;
                info!(path = %cert_path.display(), "loaded persisted internal CA");
                CertificateAuthority::load(&cert_pem, &key_pem)
            } else {
                let (cert_pem, key_pem) = CertificateAuthority::generate_self_signed(
                    &config.ca_common_name,
                    config.ca_ttl,
                )?;
                std::fs::write(cert_path, &cert_pem)?;
                std::fs::write(key_path, &key_pem)?;
                info!(path = %cert_path.display(), "generated and persisted internal CA");
                CertificateAuthority::load(&cert_pem, &key_pem)
            }
        }
        _ => {
            let (cert_pem, key_pem) =
                CertificateAuthority::generate_self_signed(&config.ca_common_name, config.ca_ttl)?;
            warn!("no CA persistence configured, internal CA is in-memory only");
            CertificateAuthority::load(&cert_pem, &key_pem)
        }
    }
}

/// Issue and install the controller's own serving certificate: SPIFFE
/// identity plus `localhost`/`127.0.0.1` SANs for local tooling.
fn install_controller_cert(
    ca: &CertificateAuthority,
    trust_domain: &TrustDomain,
    store: &CertificateStore,
) -> Result<()> {
    let spiffe = SpiffeId::new(trust_domain.clone(), WorkloadRole::Controller, "controller")?;
    let key = crate::identity::ca::generate_key_pair()?;
    let cert = ca.issue_workload_cert(
        &spiffe.uri(),
        &key.public_key_pem(),
        config::CONTROLLER_CERT_TTL,
        &["localhost".to_string()],
        &["127.0.0.1".parse().expect("loopback address")],
    )?;
    store.install(&cert, &key.serialize_pem())?;
    Ok(())
}

/// Renew the controller's serving certificate against the local CA on the
/// same schedule remote workloads use.
async fn rotate_controller_cert(state: Arc<ControllerState>, cancel: CancellationToken) {
    loop {
        let Some(identity) = state.server_store.current() else {
            return;
        };
        let next_at = next_renewal_at(identity.not_before, identity.not_after, chrono::Utc::now());
        let wait = (next_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(10));

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        match install_controller_cert(&state.ca, &state.trust_domain, &state.server_store) {
            Ok(()) => info!("controller serving certificate rotated"),
            Err(e) => {
                // Next loop iteration reschedules against the unchanged
                // expiry, which retries shortly.
                error!(error = %e, "controller certificate rotation failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
            }
        }
    }
}
