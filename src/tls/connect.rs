//! mTLS dialer for gRPC channels.
//!
//! Channels are built with a custom connector so the handshake runs through
//! our rustls configuration (pinned CA, SPIFFE peer verification, rotating
//! client certificate). Transport keepalives are tuned to detect dead peers
//! within tens of seconds even without application heartbeats.

use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::errors::{Error, Result};

/// Default dial budget; enrollment and stream dials share it.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open an HTTP/2 channel to `addr` (`host:port`) over the given TLS
/// configuration.
pub async fn connect_channel(addr: &str, tls: Arc<ClientConfig>) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("https://{}", addr))
        .map_err(|e| Error::config(format!("invalid endpoint address '{}': {}", addr, e)))?
        .connect_timeout(DIAL_TIMEOUT)
        .tcp_keepalive(Some(KEEPALIVE_INTERVAL))
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true);

    let channel = endpoint
        .connect_with_connector(service_fn(move |uri: Uri| {
            let tls = tls.clone();
            async move {
                let authority = uri
                    .authority()
                    .ok_or_else(|| std::io::Error::other("endpoint URI has no authority"))?
                    .clone();
                let host = authority.host().to_string();
                let port = authority.port_u16().unwrap_or(443);

                let tcp = TcpStream::connect((host.as_str(), port)).await?;
                tcp.set_nodelay(true)?;

                let server_name = ServerName::try_from(host)
                    .map_err(|e| std::io::Error::other(format!("invalid server name: {}", e)))?;
                let stream = TlsConnector::from(tls).connect(server_name, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| Error::transport(format!("failed to dial {}: {}", addr, e)))?;

    Ok(channel)
}
