//! Controller side of the `Connect` control stream.
//!
//! Each accepted connector stream gets its own task and a bounded outbound
//! mailbox. On accept the controller pushes a full allowlist snapshot, then
//! forwards single-entry deltas as tunnelers enroll. Inbound traffic is
//! heartbeats: connector heartbeats land in the connector registry, relayed
//! tunneler heartbeats land in the tunneler registry. No lock is ever held
//! across a send.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::control::{ControlEvent, TunnelerBeat};
use crate::controller::auth::peer_identity;
use crate::controller::ControllerState;
use crate::errors::{AuthErrorType, Error};
use crate::identity::WorkloadRole;
use crate::proto::v1::control_plane_server::ControlPlane;
use crate::proto::v1::ControlMessage;

/// Outbound mailbox depth per connector stream.
const MAILBOX: usize = 64;

pub struct ControlPlaneApi {
    state: Arc<ControllerState>,
}

impl ControlPlaneApi {
    pub fn new(state: Arc<ControllerState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl ControlPlane for ControlPlaneApi {
    type ConnectStream = ReceiverStream<std::result::Result<ControlMessage, Status>>;

    async fn connect(
        &self,
        request: Request<Streaming<ControlMessage>>,
    ) -> std::result::Result<Response<Self::ConnectStream>, Status> {
        let peer = peer_identity(&request)?;
        if peer.spiffe.role != WorkloadRole::Connector {
            return Err(Error::auth(
                format!("control streams are connector-only, got '{}'", peer.spiffe.role),
                AuthErrorType::RoleNotAllowed,
            )
            .into());
        }

        let connector_id = peer.spiffe.id.clone();
        let state = self.state.clone();
        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(MAILBOX);
        let mut deltas = state.allowlist.subscribe();
        let cancel = state.cancel.clone();

        info!(connector_id = %connector_id, spiffe_id = %peer.spiffe, "control stream accepted");

        tokio::spawn(async move {
            // A reconnecting connector always reconciles from a fresh
            // snapshot before any deltas arrive.
            if send_event(&tx, ControlEvent::AllowlistSnapshot(state.allowlist.snapshot()))
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(connector_id = %connector_id, "controller shutting down, closing stream");
                        break;
                    }
                    result = in_stream.next() => {
                        match result {
                            Some(Ok(msg)) => {
                                match ControlEvent::from_message(msg) {
                                    Ok(event) => {
                                        if handle_inbound(&state, &connector_id, event, &tx).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(connector_id = %connector_id, error = %e, "discarding malformed control message");
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(connector_id = %connector_id, error = %e, "control stream receive error");
                                break;
                            }
                            None => {
                                info!(connector_id = %connector_id, "control stream closed by connector");
                                break;
                            }
                        }
                    }
                    delta = deltas.recv() => {
                        match delta {
                            Ok(entry) => {
                                if send_event(&tx, ControlEvent::AllowlistAdd(entry)).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(connector_id = %connector_id, skipped, "allowlist deltas lagged, resending snapshot");
                                if send_event(&tx, ControlEvent::AllowlistSnapshot(state.allowlist.snapshot())).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                debug!(connector_id = %connector_id, "allowlist hub closed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Apply one inbound event from a connector stream. Returns `Err` only when
/// the outbound mailbox is gone and the stream task should exit.
async fn handle_inbound(
    state: &ControllerState,
    connector_id: &str,
    event: ControlEvent,
    tx: &mpsc::Sender<std::result::Result<ControlMessage, Status>>,
) -> std::result::Result<(), ()> {
    match event {
        ControlEvent::ConnectorHello { connector_id: hello_id, private_ip } => {
            if hello_id != connector_id {
                warn!(
                    connector_id = %connector_id,
                    hello_id = %hello_id,
                    "hello id does not match stream identity, ignoring"
                );
                return Ok(());
            }
            state.connectors.record_heartbeat(connector_id, Some(&private_ip));
            info!(connector_id = %connector_id, private_ip = %private_ip, "connector hello");
        }
        ControlEvent::Heartbeat { connector_id: beat_id, private_ip, .. } => {
            // Presence is keyed to the authenticated stream identity, never
            // to a self-reported id.
            if beat_id != connector_id {
                warn!(
                    connector_id = %connector_id,
                    beat_id = %beat_id,
                    "heartbeat id does not match stream identity, ignoring"
                );
                return Ok(());
            }
            state.connectors.record_heartbeat(connector_id, Some(&private_ip));
        }
        ControlEvent::TunnelerHeartbeat(beat) => {
            apply_tunneler_beat(state, connector_id, &beat);
        }
        ControlEvent::Ping => {
            send_event(tx, ControlEvent::Pong).await?;
        }
        other => {
            debug!(connector_id = %connector_id, event = ?other, "ignoring unexpected control message");
        }
    }
    Ok(())
}

fn apply_tunneler_beat(state: &ControllerState, connector_id: &str, beat: &TunnelerBeat) {
    state.tunnelers.record_heartbeat(&beat.tunneler_id, &beat.spiffe_id, connector_id);
}

async fn send_event(
    tx: &mpsc::Sender<std::result::Result<ControlMessage, Status>>,
    event: ControlEvent,
) -> std::result::Result<(), ()> {
    let msg = match event.into_message() {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "failed to encode control message");
            return Ok(());
        }
    };
    tx.send(Ok(msg)).await.map_err(|_| {
        debug!("control stream mailbox dropped");
    })
}
