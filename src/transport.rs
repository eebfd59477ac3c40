//! Socket lifecycle for both connection roles.
//!
//! The listener prefers TLS and degrades to plain TCP when certificate
//! material cannot be loaded; the outbound path tries a TLS handshake
//! first and retries in the clear when the peer does not speak it. Both
//! roles hand back a [`PeerStream`] so everything above this module is
//! indifferent to which variant a connection ended up as.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::protocol::{timeouts, SOCKET_BUFFER};
use crate::tls;

/// An established connection, secured when the handshake succeeded.
pub enum PeerStream {
    Plain(TcpStream),
    Secure(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl PeerStream {
    pub fn is_secure(&self) -> bool {
        matches!(self, PeerStream::Secure(_))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            PeerStream::Plain(s) => s.peer_addr(),
            PeerStream::Secure(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerStream::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Per-connection socket tuning. Failures here degrade throughput or
/// liveness detection but never a transfer, so they are only logged.
pub(crate) fn tune_socket(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let keepalive = socket2::TcpKeepalive::new().with_time(timeouts::KEEPALIVE);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "keep-alive tuning failed");
    }
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER);
}

/// Accepting side. Holds a TLS acceptor when certificate material loaded;
/// otherwise every accepted socket stays plain.
pub struct Listener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl Listener {
    /// Bind on all interfaces. When `prefer_secure` is set and the server
    /// certificate cannot be loaded or generated, the listener comes up
    /// in plain mode on the same port instead of failing.
    pub async fn bind(
        port: u16,
        prefer_secure: bool,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    ) -> Result<Self> {
        let acceptor = if prefer_secure {
            match tls::load_or_generate_server_config(cert, key) {
                Ok(cfg) => Some(TlsAcceptor::from(Arc::new(cfg))),
                Err(e) => {
                    warn!(error = %e, "secure listener unavailable, accepting plain connections");
                    None
                }
            }
        } else {
            None
        };
        let inner = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind 0.0.0.0:{port}"))?;
        Ok(Self { inner, acceptor })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Accept one connection, completing the TLS handshake when this
    /// listener is secure. A failed handshake drops only that socket;
    /// the caller keeps accepting.
    pub async fn accept(&self) -> Result<(PeerStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await.context("accept")?;
        tune_socket(&stream);
        match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .with_context(|| format!("tls handshake with {peer}"))?;
                Ok((PeerStream::Secure(Box::new(tls.into())), peer))
            }
            None => Ok((PeerStream::Plain(stream), peer)),
        }
    }
}

/// Connect to a peer. With `prefer_secure`, a TLS handshake is attempted
/// first and a plain connection is made when it fails for any reason
/// (peer without TLS, changed pin, handshake error). The caller wraps
/// this in the overall connect timeout.
pub async fn connect(host: &str, port: u16, prefer_secure: bool) -> Result<PeerStream> {
    if prefer_secure {
        match connect_secure(host, port).await {
            Ok(s) => return Ok(s),
            Err(e) => warn!(host, port, error = %e, "secure connect failed, retrying plain"),
        }
    }
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect {host}:{port}"))?;
    tune_socket(&stream);
    Ok(PeerStream::Plain(stream))
}

async fn connect_secure(host: &str, port: u16) -> Result<PeerStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect {host}:{port}"))?;
    tune_socket(&stream);
    let config = tls::build_client_config_tofu(host, port);
    let connector = TlsConnector::from(Arc::new(config));
    let name = tls::server_name_for(host);
    let tls = tokio::time::timeout(timeouts::TLS_HANDSHAKE, connector.connect(name, stream))
        .await
        .context("tls handshake timed out")?
        .context("tls handshake")?;
    Ok(PeerStream::Secure(Box::new(tls.into())))
}
