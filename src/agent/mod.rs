//! Workload-side client runtime shared by connectors and tunnelers:
//! bootstrap enrollment against the controller and the certificate renewal
//! loop that keeps the rotating store fresh.

pub mod enroll;
pub mod renewal;

use std::sync::Arc;

use crate::identity::{CertificateStore, SpiffeId};

/// A workload's live identity: the rotating certificate store plus the
/// pinned controller CA it was bootstrapped against.
#[derive(Debug)]
pub struct WorkloadIdentity {
    pub spiffe: SpiffeId,
    pub store: Arc<CertificateStore>,
    /// Pinned internal CA, PEM. Every renewal response is compared against
    /// this by DER equality.
    pub ca_pem: String,
    pub ca_der: Vec<u8>,
}
