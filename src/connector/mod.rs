//! Connector runtime: bootstrap enrollment, the uplink stream to the
//! controller, the inbound mTLS server for tunnelers, and the renewal task.

pub mod allowlist;
pub mod inbound;
pub mod uplink;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::agent::enroll::{enroll, EnrollAs};
use crate::agent::renewal::renewal_loop;
use crate::config::ConnectorConfig;
use crate::connector::allowlist::LocalAllowlist;
use crate::connector::uplink::{run_uplink, UplinkConfig};
use crate::errors::{Error, Result};

/// Buffered tunneler heartbeats awaiting relay to the controller.
const RELAY_BUFFER: usize = 64;

/// Run the connector until `cancel` fires or its identity is lost.
pub async fn run_connector(config: ConnectorConfig, cancel: CancellationToken) -> Result<()> {
    let private_ip = resolve_private_ip(&config)?;
    info!(id = %config.id, private_ip = %private_ip, "starting connector");

    let identity = Arc::new(
        enroll(
            &config.controller_addr,
            &config.trust_domain,
            &config.controller_ca,
            &config.id,
            &config.enrollment_token,
            EnrollAs::Connector {
                private_ip: private_ip.to_string(),
                version: config.version.clone(),
            },
        )
        .await?,
    );

    let (reload_tx, reload_rx) = watch::channel(0u64);
    let (relay_tx, relay_rx) = mpsc::channel(RELAY_BUFFER);
    let allowlist = Arc::new(LocalAllowlist::new());

    let inbound_task = tokio::spawn(inbound::start_inbound_server(
        identity.clone(),
        config.inbound_bind_address(),
        config.trust_domain.clone(),
        allowlist.clone(),
        relay_tx,
        cancel.clone(),
    ));

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

    let uplink_config = UplinkConfig {
        controller_addr: config.controller_addr.clone(),
        connector_id: config.id.clone(),
        private_ip: private_ip.to_string(),
        trust_domain: config.trust_domain.clone(),
    };
    let uplink_cancel = cancel.clone();
    let uplink_task = tokio::spawn(run_uplink(
        identity,
        uplink_config,
        allowlist,
        relay_rx,
        reload_rx,
        uplink_cancel,
    ));

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        joined = inbound_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::internal(format!("inbound server task panicked: {}", e))),
        },
        joined = renewal_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "identity lost, connector must re-enroll");
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
    info!("connector shutdown completed");
    result
}

/// Pick the address advertised to the controller: the configured override,
/// or the local address of the route towards the controller.
fn resolve_private_ip(config: &ConnectorConfig) -> Result<IpAddr> {
    if let Some(ip) = config.private_ip {
        return Ok(ip);
    }

    // Connected UDP sockets never send a packet; they only resolve the
    // local source address for the route.
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect(&config.controller_addr).map(|()| socket))
        .map_err(|e| {
            Error::config(format!(
                "failed to detect private address towards '{}': {} (set TRUSTPLANE_PRIVATE_IP)",
                config.controller_addr, e
            ))
        })?;
    let local = socket.local_addr().map_err(|e| {
        Error::config(format!("failed to read detected local address: {} (set TRUSTPLANE_PRIVATE_IP)", e))
    })?;
    Ok(local.ip())
}
