//! TLS accept loop feeding tonic.
//!
//! tonic's bundled TLS support fixes the server identity at startup; to let
//! renewal swap certificates under a live listener, the TCP accept loop and
//! rustls handshake are driven here and the resulting streams are handed to
//! `Server::serve_with_incoming`. Each accepted stream carries a
//! [`TlsConnectInfo`] so the authentication layer can read the peer
//! certificate chain from request extensions.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tracing::{debug, warn};

/// Pending handshakes queued for the gRPC server.
const ACCEPT_BACKLOG: usize = 64;

/// Connection metadata published into request extensions by tonic.
#[derive(Debug, Clone)]
pub struct TlsConnectInfo {
    pub remote_addr: SocketAddr,
    /// Peer chain as presented during the handshake; `None` for anonymous
    /// clients on listeners that allow them.
    pub peer_certificates: Option<Arc<Vec<CertificateDer<'static>>>>,
}

/// A finished server-side TLS session.
pub struct TlsConnection {
    inner: tokio_rustls::server::TlsStream<TcpStream>,
    info: TlsConnectInfo,
}

impl Connected for TlsConnection {
    type ConnectInfo = TlsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Accept TCP connections, run TLS handshakes, and yield finished sessions.
///
/// Handshakes run in their own tasks so a slow or malicious peer cannot stall
/// the accept loop. Handshake failures are logged and dropped; they never
/// terminate the listener. The stream ends when `cancel` fires.
pub fn serve_tls_incoming(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) -> ReceiverStream<std::io::Result<TlsConnection>> {
    let (tx, rx) = mpsc::channel::<std::io::Result<TlsConnection>>(ACCEPT_BACKLOG);
    let acceptor = TlsAcceptor::from(config);

    tokio::spawn(async move {
        loop {
            let (tcp, remote_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept TCP connection");
                        continue;
                    }
                },
            };

            if let Err(e) = tcp.set_nodelay(true) {
                debug!(error = %e, peer = %remote_addr, "failed to set TCP_NODELAY");
            }

            let acceptor = acceptor.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let handshake = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = acceptor.accept(tcp) => result,
                };

                match handshake {
                    Ok(stream) => {
                        let peer_certificates = stream
                            .get_ref()
                            .1
                            .peer_certificates()
                            .map(|certs| Arc::new(certs.to_vec()));
                        let conn = TlsConnection {
                            inner: stream,
                            info: TlsConnectInfo { remote_addr, peer_certificates },
                        };
                        if tx.send(Ok(conn)).await.is_err() {
                            debug!("incoming connection receiver dropped");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, peer = %remote_addr, "TLS handshake failed");
                    }
                }
            });
        }
    });

    ReceiverStream::new(rx)
}
