use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::bridge::Accept;
use crate::error::{Error, Result};
use crate::stream::ConnMeta;

/// How long a client may take to finish the server handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side TLS layered over any [`Accept`] source.
///
/// `accept` hands back the raw connection with its handshake still pending,
/// so one slow or broken client never holds up the accept loop.
pub struct TlsListener<L> {
    inner: L,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl<L: Accept> TlsListener<L> {
    pub fn new(inner: L, config: Arc<ServerConfig>) -> Self {
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub async fn accept(&self) -> Result<Handshake<L::Io>> {
        let (io, meta) = self.inner.accept().await?;
        Ok(Handshake {
            accept: self.acceptor.accept(io),
            meta,
            timeout: self.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// An accepted connection whose TLS handshake has not run yet.
pub struct Handshake<IO> {
    accept: tokio_rustls::Accept<IO>,
    meta: ConnMeta,
    timeout: Duration,
}

impl<IO> Handshake<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn meta(&self) -> &ConnMeta {
        &self.meta
    }

    /// Drive the server handshake to completion.
    pub async fn complete(self) -> Result<(TlsStream<IO>, ConnMeta)> {
        match tokio::time::timeout(self.timeout, self.accept).await {
            Ok(Ok(stream)) => Ok((stream, self.meta)),
            Ok(Err(e)) => Err(Error::Tls(format!("handshake failed: {e}"))),
            Err(_) => Err(Error::Tls(format!(
                "handshake timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
