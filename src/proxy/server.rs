use std::convert::Infallible;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge::Accept;
use crate::error::{Error, Result};
use crate::proxy::forwarder::Forwarder;
use crate::proxy::tls_acceptor::{Handshake, TlsListener};

/// Run the accept loop until the listener closes or shutdown is signalled.
///
/// Each connection gets its own task for the handshake and HTTP exchanges.
/// Failures there are logged and never end the loop. On shutdown, live
/// connections finish their in-flight request and then close.
pub async fn serve<L: Accept>(
    listener: TlsListener<L>,
    forwarder: Arc<Forwarder>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr(), "proxy engine accepting connections");

    let mut next_conn_id: u64 = 0;
    loop {
        tokio::select! {
            result = listener.accept() => {
                let handshake = match result {
                    Ok(handshake) => handshake,
                    Err(Error::Closed) => {
                        info!("listener closed, proxy engine stopping");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                next_conn_id += 1;
                let span = info_span!(
                    "conn",
                    conn_id = next_conn_id,
                    peer = ?handshake.meta().peer_addr
                );
                span.in_scope(|| debug!("accepted handed-off connection"));
                tokio::spawn(
                    serve_connection(handshake, forwarder.clone(), shutdown.clone())
                        .instrument(span),
                );
            }
            _ = shutdown.changed() => {
                info!("proxy engine shutting down");
                return listener.close();
            }
        }
    }
}

async fn serve_connection<IO>(
    handshake: Handshake<IO>,
    forwarder: Arc<Forwarder>,
    mut shutdown: watch::Receiver<bool>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tls_stream, meta) = match handshake.complete().await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(error = %e, "dropping connection");
            return;
        }
    };

    let service = service_fn(move |req| {
        let forwarder = forwarder.clone();
        async move { Ok::<_, Infallible>(forwarder.forward(req, meta).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    match result {
        Ok(()) => debug!("connection closed"),
        Err(e) => debug!(error = %e, "connection ended with error"),
    }
}
