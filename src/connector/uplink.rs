//! Connector uplink: the persistent control stream to the controller.
//!
//! One task owns the stream. It says hello, heartbeats every 10 seconds,
//! relays tunneler heartbeats from the inbound server, and applies allowlist
//! pushes to the local cache. Transient failures tear the session down and
//! redial with exponential backoff (2s doubling to 30s); a renewal reload
//! signal tears the session down immediately so the next handshake uses the
//! new certificate. Authentication rejections are not retried: they need
//! operator intervention, so the loop surfaces them as a hard error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::WorkloadIdentity;
use crate::connector::allowlist::LocalAllowlist;
use crate::control::{ControlEvent, PresenceStatus, TunnelerBeat, HEARTBEAT_PERIOD};
use crate::errors::{Error, Result};
use crate::identity::{TrustDomain, WorkloadRole};
use crate::proto::v1::control_plane_client::ControlPlaneClient;
use crate::proto::v1::ControlMessage;
use crate::tls;

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Why a session ended.
enum SessionEnd {
    /// The renewal loop swapped certificates; reconnect immediately.
    Reload,
    /// Peer closed or errored; reconnect after backoff.
    Closed,
}

pub struct UplinkConfig {
    pub controller_addr: String,
    pub connector_id: String,
    pub private_ip: String,
    pub trust_domain: TrustDomain,
}

/// Drive the uplink until cancellation or a non-retryable rejection.
pub async fn run_uplink(
    identity: Arc<WorkloadIdentity>,
    config: UplinkConfig,
    allowlist: Arc<LocalAllowlist>,
    mut relay_rx: mpsc::Receiver<TunnelerBeat>,
    mut reload_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match run_session(
            &identity,
            &config,
            &allowlist,
            &mut relay_rx,
            &mut reload_rx,
            &cancel,
        )
        .await
        {
            Ok(SessionEnd::Reload) => {
                info!(connector_id = %config.connector_id, "identity rotated, re-dialing control stream");
                backoff = BACKOFF_INITIAL;
            }
            Ok(SessionEnd::Closed) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(
                    connector_id = %config.connector_id,
                    backoff_secs = backoff.as_secs(),
                    "control stream closed, reconnecting"
                );
                if sleep_backoff(&mut backoff, &cancel).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    connector_id = %config.connector_id,
                    error = %e,
                    backoff_secs = backoff.as_secs(),
                    "control stream failed, reconnecting"
                );
                if sleep_backoff(&mut backoff, &cancel).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                error!(
                    connector_id = %config.connector_id,
                    error = %e,
                    "control stream rejected, not retrying"
                );
                return Err(e);
            }
        }
    }
}

async fn sleep_backoff(backoff: &mut Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::transport("cancelled")),
        _ = tokio::time::sleep(*backoff) => {}
    }
    *backoff = (*backoff * 2).min(BACKOFF_MAX);
    Ok(())
}

async fn run_session(
    identity: &WorkloadIdentity,
    config: &UplinkConfig,
    allowlist: &LocalAllowlist,
    relay_rx: &mut mpsc::Receiver<TunnelerBeat>,
    reload_rx: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
) -> Result<SessionEnd> {
    // Clear any reload signal that fired while we were disconnected.
    reload_rx.mark_unchanged();

    let tls_config = tls::client_config(
        identity.store.clone(),
        &identity.ca_pem,
        &config.trust_domain,
        WorkloadRole::Controller,
    )?;
    let channel = tls::connect_channel(&config.controller_addr, tls_config).await?;
    let mut client = ControlPlaneClient::new(channel);

    let (out_tx, out_rx) = mpsc::channel::<ControlMessage>(64);
    let mut inbound = client
        .connect(ReceiverStream::new(out_rx))
        .await
        .map_err(Error::from)?
        .into_inner();

    send(
        &out_tx,
        ControlEvent::ConnectorHello {
            connector_id: config.connector_id.clone(),
            private_ip: config.private_ip.clone(),
        },
    )
    .await?;
    info!(
        connector_id = %config.connector_id,
        controller = %config.controller_addr,
        "control stream established"
    );

    let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Closed),
            result = reload_rx.changed() => {
                if result.is_err() {
                    // Renewal task is gone; the runtime is tearing down.
                    return Ok(SessionEnd::Closed);
                }
                return Ok(SessionEnd::Reload);
            }
            _ = heartbeat.tick() => {
                send(&out_tx, ControlEvent::Heartbeat {
                    connector_id: config.connector_id.clone(),
                    private_ip: config.private_ip.clone(),
                    status: PresenceStatus::Online,
                }).await?;
            }
            beat = relay_rx.recv() => {
                let Some(mut beat) = beat else {
                    return Ok(SessionEnd::Closed);
                };
                beat.status.get_or_insert_with(|| PresenceStatus::Online.to_string());
                beat.connector_id = Some(config.connector_id.clone());
                send(&out_tx, ControlEvent::TunnelerHeartbeat(beat)).await?;
            }
            msg = inbound.next() => {
                match msg {
                    Some(Ok(msg)) => handle_push(config, allowlist, &out_tx, msg).await?,
                    Some(Err(status)) => {
                        return Err(Error::from(status));
                    }
                    None => return Ok(SessionEnd::Closed),
                }
            }
        }
    }
}

async fn handle_push(
    config: &UplinkConfig,
    allowlist: &LocalAllowlist,
    out_tx: &mpsc::Sender<ControlMessage>,
    msg: ControlMessage,
) -> Result<()> {
    match ControlEvent::from_message(msg) {
        Ok(ControlEvent::AllowlistSnapshot(entries)) => {
            info!(
                connector_id = %config.connector_id,
                entries = entries.len(),
                "applied allowlist snapshot"
            );
            allowlist.replace_snapshot(entries);
        }
        Ok(ControlEvent::AllowlistAdd(entry)) => {
            debug!(
                connector_id = %config.connector_id,
                tunneler_id = %entry.tunneler_id,
                "applied allowlist delta"
            );
            allowlist.insert(entry);
        }
        Ok(ControlEvent::Ping) => send(out_tx, ControlEvent::Pong).await?,
        Ok(ControlEvent::Pong) => {}
        Ok(other) => {
            debug!(connector_id = %config.connector_id, event = ?other, "ignoring control push");
        }
        Err(e) => {
            warn!(connector_id = %config.connector_id, error = %e, "discarding malformed control push");
        }
    }
    Ok(())
}

async fn send(tx: &mpsc::Sender<ControlMessage>, event: ControlEvent) -> Result<()> {
    let msg = event.into_message()?;
    tx.send(msg)
        .await
        .map_err(|_| Error::transport("control stream sender closed"))
}
