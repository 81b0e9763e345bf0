//! Connector inbound server for tunnelers.
//!
//! A strict-mTLS listener (client certificates required) whose auth policy
//! admits only allowlisted tunneler identities. Accepted streams carry
//! hellos and heartbeats; each heartbeat is stamped with the authenticated
//! identity and offered to the uplink relay with non-blocking semantics —
//! when the relay is saturated the beat is dropped rather than
//! back-pressuring the tunneler's stream.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::agent::WorkloadIdentity;
use crate::connector::allowlist::LocalAllowlist;
use crate::control::{ControlEvent, TunnelerBeat};
use crate::controller::auth::{peer_identity, AuthLayer, AuthPolicy, PeerIdentity};
use crate::errors::{Error, Result};
use crate::identity::TrustDomain;
use crate::proto::v1::control_plane_server::{ControlPlane, ControlPlaneServer};
use crate::proto::v1::ControlMessage;
use crate::tls::{self, ClientAuthPolicy};

/// Gateway service terminating tunneler control streams.
pub struct TunnelerGateway {
    relay_tx: mpsc::Sender<TunnelerBeat>,
    cancel: CancellationToken,
}

impl TunnelerGateway {
    pub fn new(relay_tx: mpsc::Sender<TunnelerBeat>, cancel: CancellationToken) -> Self {
        Self { relay_tx, cancel }
    }
}

#[tonic::async_trait]
impl ControlPlane for TunnelerGateway {
    type ConnectStream = ReceiverStream<std::result::Result<ControlMessage, Status>>;

    async fn connect(
        &self,
        request: Request<Streaming<ControlMessage>>,
    ) -> std::result::Result<Response<Self::ConnectStream>, Status> {
        let peer = peer_identity(&request)?;
        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let relay_tx = self.relay_tx.clone();
        let cancel = self.cancel.clone();

        info!(tunneler_id = %peer.spiffe.id, spiffe_id = %peer.spiffe, "tunneler stream accepted");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = in_stream.next() => {
                        match msg {
                            Some(Ok(msg)) => {
                                if handle_message(&peer, &relay_tx, &tx, msg).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(tunneler_id = %peer.spiffe.id, error = %e, "tunneler stream receive error");
                                break;
                            }
                            None => {
                                info!(tunneler_id = %peer.spiffe.id, "tunneler stream closed");
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

/// Apply one message from a tunneler. Returns `Err` only when the response
/// mailbox is gone.
async fn handle_message(
    peer: &PeerIdentity,
    relay_tx: &mpsc::Sender<TunnelerBeat>,
    tx: &mpsc::Sender<std::result::Result<ControlMessage, Status>>,
    msg: ControlMessage,
) -> std::result::Result<(), ()> {
    match ControlEvent::from_message(msg) {
        Ok(ControlEvent::TunnelerHello(beat)) | Ok(ControlEvent::TunnelerHeartbeat(beat)) => {
            relay_beat(peer, relay_tx, beat);
        }
        Ok(ControlEvent::Ping) => {
            let pong = match ControlEvent::Pong.into_message() {
                Ok(msg) => msg,
                Err(_) => return Ok(()),
            };
            if tx.send(Ok(pong)).await.is_err() {
                return Err(());
            }
        }
        Ok(other) => {
            debug!(tunneler_id = %peer.spiffe.id, event = ?other, "ignoring tunneler message");
        }
        Err(e) => {
            warn!(tunneler_id = %peer.spiffe.id, error = %e, "discarding malformed tunneler message");
        }
    }
    Ok(())
}

/// Stamp the beat with the authenticated identity and offer it upstream.
/// Self-reported ids that do not match the peer certificate are overridden.
fn relay_beat(peer: &PeerIdentity, relay_tx: &mpsc::Sender<TunnelerBeat>, beat: TunnelerBeat) {
    if !beat.tunneler_id.is_empty() && beat.tunneler_id != peer.spiffe.id {
        warn!(
            tunneler_id = %peer.spiffe.id,
            claimed = %beat.tunneler_id,
            "tunneler heartbeat claims a foreign id, using certificate identity"
        );
    }

    let stamped = TunnelerBeat {
        tunneler_id: peer.spiffe.id.clone(),
        spiffe_id: peer.spiffe.uri(),
        status: beat.status,
        connector_id: None,
    };

    // Telemetry channel: overflow drops silently rather than stalling the
    // tunneler stream.
    if relay_tx.try_send(stamped).is_err() {
        debug!(tunneler_id = %peer.spiffe.id, "relay buffer full, dropping heartbeat");
    }
}

/// Serve the inbound listener until cancellation.
pub async fn start_inbound_server(
    identity: Arc<WorkloadIdentity>,
    bind_addr: String,
    trust_domain: TrustDomain,
    allowlist: Arc<LocalAllowlist>,
    relay_tx: mpsc::Sender<TunnelerBeat>,
    cancel: CancellationToken,
) -> Result<()> {
    let tls_config = tls::server_config(
        identity.store.clone(),
        &identity.ca_pem,
        ClientAuthPolicy::Required,
    )?;

    let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
        Error::transport(format!("failed to bind inbound listener on {}: {}", bind_addr, e))
    })?;
    let incoming = tls::serve_tls_incoming(listener, tls_config, cancel.clone());

    info!(address = %bind_addr, "connector inbound server listening");

    let auth_layer = AuthLayer::new(AuthPolicy::connector_inbound(trust_domain, allowlist));
    let gateway = TunnelerGateway::new(relay_tx, cancel.clone());

    Server::builder()
        .http2_keepalive_interval(Some(std::time::Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(std::time::Duration::from_secs(10)))
        .tcp_keepalive(Some(std::time::Duration::from_secs(30)))
        .layer(auth_layer)
        .add_service(ControlPlaneServer::new(gateway))
        .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
        .await
        .map_err(|e| Error::transport(format!("connector inbound server failed: {}", e)))?;

    info!("connector inbound server shutdown completed");
    Ok(())
}
