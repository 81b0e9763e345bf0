//! Certificate renewal loop.
//!
//! One task per workload identity. Renewal is scheduled at 30% of the total
//! lifetime before expiry with a 10 second floor, generates a fresh key pair
//! per attempt, renews over the current mTLS identity, and hot-swaps the
//! rotating store. A CA bundle that stops matching the pin aborts the swap:
//! the workload keeps its current identity and tries again next tick.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::WorkloadIdentity;
use crate::errors::{Error, Result};
use crate::identity::ca::generate_key_pair;
use crate::identity::{leaf, TrustDomain, WorkloadRole};
use crate::proto::v1::enrollment_service_client::EnrollmentServiceClient;
use crate::proto::v1::EnrollRequest;
use crate::tls;

/// Fraction of the total lifetime reserved for renewal headroom.
pub const RENEW_AHEAD_FRACTION: f64 = 0.30;

/// Never schedule a renewal sooner than this from now.
pub const MIN_RENEW_ADVANCE: Duration = Duration::from_secs(10);

/// Compute the next renewal instant for a certificate's validity window.
pub fn next_renewal_at(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let total = not_after.signed_duration_since(not_before);
    let renew_ahead_secs = (total.num_seconds() as f64 * RENEW_AHEAD_FRACTION) as i64;
    let candidate = not_after - chrono::Duration::seconds(renew_ahead_secs);
    let floor = now + chrono::Duration::seconds(MIN_RENEW_ADVANCE.as_secs() as i64);
    candidate.max(floor)
}

/// Run the renewal loop until cancellation or loss of identity.
///
/// Every successful swap bumps `reload_tx` so stream tasks can tear down
/// their session and reconnect with the new certificate. Returning an error
/// means the identity expired un-renewed; the caller is expected to exit and
/// let the supervisor re-enroll a fresh process.
pub async fn renewal_loop(
    identity: &WorkloadIdentity,
    controller_addr: &str,
    trust_domain: &TrustDomain,
    reload_tx: watch::Sender<u64>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ca_mismatches: u32 = 0;

    loop {
        let current = identity
            .store
            .current()
            .ok_or_else(|| Error::certificate("renewal loop started without an identity"))?;

        let now = Utc::now();
        if current.not_after <= now {
            return Err(Error::certificate(format!(
                "identity '{}' expired at {} before renewal succeeded",
                identity.spiffe, current.not_after
            )));
        }

        let next_at = next_renewal_at(current.not_before, current.not_after, now);
        let wait = (next_at - now).to_std().unwrap_or(MIN_RENEW_ADVANCE);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(wait) => {}
        }

        match renew_once(identity, controller_addr, trust_domain).await {
            Ok(not_after) => {
                ca_mismatches = 0;
                reload_tx.send_modify(|generation| *generation += 1);
                info!(
                    spiffe_id = %identity.spiffe,
                    not_after = %not_after,
                    "certificate renewed"
                );
            }
            Err(e) => {
                if matches!(&e, Error::Certificate { message, .. } if message.contains("pinned")) {
                    ca_mismatches += 1;
                    if ca_mismatches >= 2 {
                        error!(
                            spiffe_id = %identity.spiffe,
                            consecutive = ca_mismatches,
                            event = "renewal_ca_mismatch_repeated",
                            "controller CA repeatedly differs from the pinned bundle"
                        );
                    }
                } else {
                    ca_mismatches = 0;
                }
                // Retried on the next scheduled tick; the floor keeps that
                // at most MIN_RENEW_ADVANCE away.
                warn!(spiffe_id = %identity.spiffe, error = %e, "certificate renewal failed");
            }
        }
    }
}

/// One renewal attempt: fresh key, mTLS dial with the current identity,
/// pinned-CA equality check, store swap.
async fn renew_once(
    identity: &WorkloadIdentity,
    controller_addr: &str,
    trust_domain: &TrustDomain,
) -> Result<DateTime<Utc>> {
    let key = generate_key_pair()?;

    let tls_config = tls::client_config(
        identity.store.clone(),
        &identity.ca_pem,
        trust_domain,
        WorkloadRole::Controller,
    )?;
    let channel = tls::connect_channel(controller_addr, tls_config).await?;
    let mut client = EnrollmentServiceClient::new(channel);

    let response = client
        .renew(EnrollRequest {
            id: identity.spiffe.id.clone(),
            public_key: key.public_key_pem(),
            token: String::new(),
            private_ip: String::new(),
            version: String::new(),
        })
        .await?
        .into_inner();

    if leaf::first_der(&response.ca_certificate)? != identity.ca_der {
        return Err(Error::certificate(
            "renewal response CA does not match the pinned bundle",
        ));
    }

    let installed = identity.store.install(&response.certificate, &key.serialize_pem())?;
    if installed.spiffe_uri != identity.spiffe.uri() {
        return Err(Error::certificate(format!(
            "renewed certificate carries '{}', expected '{}'",
            installed.spiffe_uri,
            identity.spiffe.uri()
        )));
    }
    Ok(installed.not_after)
}
