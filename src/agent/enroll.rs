//! Bootstrap enrollment.
//!
//! The workload holds nothing but the pinned controller CA and a one-time
//! token. It generates a fresh P-256 key pair in memory, asks the controller
//! to bind its public key to a SPIFFE identity, and installs the returned
//! leaf into a new rotating store. The controller is authenticated by the
//! pinned CA plus its SPIFFE URI; the returned CA bundle must match the pin
//! byte for byte.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::agent::WorkloadIdentity;
use crate::errors::{Error, Result};
use crate::identity::ca::generate_key_pair;
use crate::identity::{leaf, CertificateStore, SpiffeId, TrustDomain, WorkloadRole};
use crate::proto::v1::enrollment_service_client::EnrollmentServiceClient;
use crate::proto::v1::EnrollRequest;
use crate::tls;

/// Whole-operation budget for one enrollment attempt.
pub const ENROLL_TIMEOUT: Duration = Duration::from_secs(15);

/// Role-specific enrollment parameters.
#[derive(Debug, Clone)]
pub enum EnrollAs {
    Connector { private_ip: String, version: String },
    Tunneler,
}

impl EnrollAs {
    fn role(&self) -> WorkloadRole {
        match self {
            EnrollAs::Connector { .. } => WorkloadRole::Connector,
            EnrollAs::Tunneler => WorkloadRole::Tunneler,
        }
    }
}

/// Enroll against the controller and return the bootstrapped identity.
pub async fn enroll(
    controller_addr: &str,
    trust_domain: &TrustDomain,
    pinned_ca_pem: &str,
    id: &str,
    token: &str,
    enroll_as: EnrollAs,
) -> Result<WorkloadIdentity> {
    tokio::time::timeout(
        ENROLL_TIMEOUT,
        enroll_inner(controller_addr, trust_domain, pinned_ca_pem, id, token, enroll_as),
    )
    .await
    .map_err(|_| Error::timeout("enrollment", ENROLL_TIMEOUT.as_millis() as u64))?
}

async fn enroll_inner(
    controller_addr: &str,
    trust_domain: &TrustDomain,
    pinned_ca_pem: &str,
    id: &str,
    token: &str,
    enroll_as: EnrollAs,
) -> Result<WorkloadIdentity> {
    let pinned_der = leaf::first_der(pinned_ca_pem)?;
    let expected = SpiffeId::new(trust_domain.clone(), enroll_as.role(), id)?;

    let tls_config = tls::bootstrap_client_config(pinned_ca_pem, trust_domain)?;
    let channel = tls::connect_channel(controller_addr, tls_config).await?;
    let mut client = EnrollmentServiceClient::new(channel);

    let key = generate_key_pair()?;
    let mut request = EnrollRequest {
        id: id.to_string(),
        public_key: key.public_key_pem(),
        token: token.to_string(),
        private_ip: String::new(),
        version: String::new(),
    };

    let response = match &enroll_as {
        EnrollAs::Connector { private_ip, version } => {
            request.private_ip = private_ip.clone();
            request.version = version.clone();
            client.enroll_connector(request).await?.into_inner()
        }
        EnrollAs::Tunneler => client.enroll_tunneler(request).await?.into_inner(),
    };

    // The CA that signed us must be the CA we were told to trust.
    if leaf::first_der(&response.ca_certificate)? != pinned_der {
        return Err(Error::certificate(
            "controller returned a CA that does not match the pinned bundle",
        ));
    }

    let store = Arc::new(CertificateStore::new());
    let identity = store.install(&response.certificate, &key.serialize_pem())?;
    if identity.spiffe_uri != expected.uri() {
        return Err(Error::certificate(format!(
            "issued certificate carries '{}', expected '{}'",
            identity.spiffe_uri,
            expected.uri()
        )));
    }

    info!(
        spiffe_id = %expected,
        not_after = %identity.not_after,
        "workload enrolled and identity installed"
    );

    Ok(WorkloadIdentity {
        spiffe: expected,
        store,
        ca_pem: pinned_ca_pem.to_string(),
        ca_der: pinned_der,
    })
}
