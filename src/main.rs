use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use https_bridge::config::{Config, LogFormat};
use https_bridge::{Adapter, ConnMeta};

/// TLS record header: content type, version, length.
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_format);
    info!(
        listen = %config.listen_addr,
        backend = %config.adapter.backend_addr,
        "https-bridge starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "https-bridge exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> https_bridge::Result<()> {
    let adapter = Arc::new(Adapter::new(config.adapter)?);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, adapter = adapter.name(), "dispatcher listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (tcp_stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept TCP connection");
                        continue;
                    }
                };

                debug!(peer = %peer_addr, "accepted TCP connection");
                let adapter = adapter.clone();
                tokio::spawn(dispatch(adapter, tcp_stream));
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping...");
                break;
            }
        }
    }

    adapter.close().await?;
    info!("https-bridge stopped");
    Ok(())
}

/// Read the first TLS record header to decide whether the connection belongs
/// to the adapter, then hand it over together with the consumed bytes.
async fn dispatch(adapter: Arc<Adapter>, mut tcp_stream: TcpStream) {
    let meta = ConnMeta {
        peer_addr: tcp_stream.peer_addr().ok(),
        local_addr: tcp_stream.local_addr().ok(),
    };

    let mut header = [0u8; RECORD_HEADER_LEN];
    match tokio::time::timeout(SNIFF_TIMEOUT, tcp_stream.read_exact(&mut header)).await {
        Ok(Ok(_)) if header[0] == HANDSHAKE_CONTENT_TYPE => {
            adapter.handle(tcp_stream, meta, Bytes::copy_from_slice(&header));
        }
        Ok(Ok(_)) => {
            warn!(peer = ?meta.peer_addr, first_byte = header[0], "not a TLS handshake, dropping");
        }
        Ok(Err(e)) => {
            debug!(peer = ?meta.peer_addr, error = %e, "connection closed before routing");
        }
        Err(_) => {
            debug!(peer = ?meta.peer_addr, "timed out waiting for TLS record header");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
