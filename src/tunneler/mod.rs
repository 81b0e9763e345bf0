//! Tunneler runtime: bootstrap enrollment against the controller, a
//! persistent control stream to the assigned connector, and the renewal
//! task. The tunneler's certificate is admitted by the connector only after
//! the controller has broadcast its identity to the allowlist.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::enroll::{enroll, EnrollAs};
use crate::agent::renewal::renewal_loop;
use crate::agent::WorkloadIdentity;
use crate::config::TunnelerConfig;
use crate::control::{ControlEvent, TunnelerBeat, HEARTBEAT_PERIOD};
use crate::errors::{Error, Result};
use crate::identity::WorkloadRole;
use crate::proto::v1::control_plane_client::ControlPlaneClient;
use crate::proto::v1::ControlMessage;
use crate::tls;

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Run the tunneler until `cancel` fires or its identity is lost.
pub async fn run_tunneler(config: TunnelerConfig, cancel: CancellationToken) -> Result<()> {
    info!(id = %config.id, connector = %config.connector_addr, "starting tunneler");

    let identity = Arc::new(
        enroll(
            &config.controller_addr,
            &config.trust_domain,
            &config.controller_ca,
            &config.id,
            &config.enrollment_token,
            EnrollAs::Tunneler,
        )
        .await?,
    );

    let (reload_tx, reload_rx) = watch::channel(0u64);

    let renewal_identity = identity.clone();
    let renewal_cancel = cancel.clone();
    let controller_addr = config.controller_addr.clone();
    let trust_domain = config.trust_domain.clone();
    let renewal_task = tokio::spawn(async move {
        renewal_loop(
            &renewal_identity,
            &controller_addr,
            &trust_domain,
            reload_tx,
            renewal_cancel,
        )
        .await
    });

    let uplink_cancel = cancel.clone();
    let uplink_config = config.clone();
    let uplink_identity = identity.clone();
    let uplink_task =
        tokio::spawn(run_uplink(uplink_identity, uplink_config, reload_rx, uplink_cancel));

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        joined = renewal_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "identity lost, tunneler must re-enroll");
                Err(e)
            }
            Err(e) => Err(Error::internal(format!("renewal task panicked: {}", e))),
        },
        joined = uplink_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::internal(format!("uplink task panicked: {}", e))),
        },
    };

    cancel.cancel();
    info!("tunneler shutdown completed");
    result
}

enum SessionEnd {
    Reload,
    Closed,
}

async fn run_uplink(
    identity: Arc<WorkloadIdentity>,
    config: TunnelerConfig,
    mut reload_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match run_session(&identity, &config, &mut reload_rx, &cancel).await {
            Ok(SessionEnd::Reload) => {
                info!(id = %config.id, "identity rotated, re-dialing connector stream");
                backoff = BACKOFF_INITIAL;
            }
            Ok(SessionEnd::Closed) if cancel.is_cancelled() => return Ok(()),
            Ok(SessionEnd::Closed) => {
                warn!(id = %config.id, backoff_secs = backoff.as_secs(), "connector stream closed, reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
            Err(e) if e.is_retryable() => {
                warn!(id = %config.id, error = %e, backoff_secs = backoff.as_secs(), "connector stream failed, reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
            Err(e) => {
                // The allowlist delta for this identity is published before
                // enrollment returns, so a rejection here is an auth failure
                // that needs operator intervention, not a startup race.
                error!(id = %config.id, error = %e, "connector stream rejected, not retrying");
                return Err(e);
            }
        }
    }
}

async fn run_session(
    identity: &WorkloadIdentity,
    config: &TunnelerConfig,
    reload_rx: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
) -> Result<SessionEnd> {
    reload_rx.mark_unchanged();

    let tls_config = tls::client_config(
        identity.store.clone(),
        &identity.ca_pem,
        &config.trust_domain,
        WorkloadRole::Connector,
    )?;
    let channel = tls::connect_channel(&config.connector_addr, tls_config).await?;
    let mut client = ControlPlaneClient::new(channel);

    let (out_tx, out_rx) = mpsc::channel::<ControlMessage>(16);
    let mut inbound = client
        .connect(ReceiverStream::new(out_rx))
        .await
        .map_err(Error::from)?
        .into_inner();

    let beat = TunnelerBeat {
        tunneler_id: identity.spiffe.id.clone(),
        spiffe_id: identity.spiffe.uri(),
        status: None,
        connector_id: None,
    };

    send(&out_tx, ControlEvent::TunnelerHello(beat.clone())).await?;
    info!(id = %config.id, connector = %config.connector_addr, "connector stream established");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Closed),
            result = reload_rx.changed() => {
                if result.is_err() {
                    return Ok(SessionEnd::Closed);
                }
                return Ok(SessionEnd::Reload);
            }
            _ = heartbeat.tick() => {
                send(&out_tx, ControlEvent::TunnelerHeartbeat(beat.clone())).await?;
            }
            msg = inbound.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        match ControlEvent::from_message(msg) {
                            Ok(ControlEvent::Ping) => send(&out_tx, ControlEvent::Pong).await?,
                            Ok(other) => {
                                debug!(id = %config.id, event = ?other, "ignoring connector push");
                            }
                            Err(e) => {
                                warn!(id = %config.id, error = %e, "discarding malformed connector push");
                            }
                        }
                    }
                    Some(Err(status)) => return Err(Error::from(status)),
                    None => return Ok(SessionEnd::Closed),
                }
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<ControlMessage>, event: ControlEvent) -> Result<()> {
    let msg = event.into_message()?;
    tx.send(msg)
        .await
        .map_err(|_| Error::transport("connector stream sender closed"))
}
