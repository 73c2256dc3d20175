use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::proxy::forwarder::Forwarder;
use crate::proxy::server;
use crate::proxy::tls_acceptor::TlsListener;
use crate::stream::{ConnMeta, Io, PrefixedStream};
use crate::tls::TlsIdentity;

/// Identifier the dispatcher registers this adapter kind under.
pub const NAME: &str = "https2https_certs";

/// Terminates TLS on handed-off connections and forwards the decrypted HTTP
/// traffic to the backend over mutual TLS.
///
/// Must be created inside a Tokio runtime: construction starts the accept
/// loop as a background task that runs until [`Adapter::close`].
pub struct Adapter {
    config: AdapterConfig,
    bridge: Bridge,
    shutdown: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Adapter {
    /// Load both TLS identities, wire bridge → TLS → proxy engine and start
    /// serving. Nothing is left running if any step fails.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("adapter requires a tokio runtime: {e}")))?;

        let server_identity =
            TlsIdentity::load(&config.server_cert_path, &config.server_key_path, None)?;
        let backend_identity = TlsIdentity::load(
            &config.backend_cert_path,
            &config.backend_key_path,
            Some(config.backend_ca_path.as_path()),
        )?;

        let server_tls = Arc::new(server_identity.server_config()?);
        let forwarder = Arc::new(Forwarder::new(&config, backend_identity.client_config()?)?);

        let bridge = Bridge::new();
        let listener = TlsListener::new(bridge.clone(), server_tls)
            .with_handshake_timeout(config.handshake_timeout);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = runtime.spawn(server::serve(listener, forwarder, shutdown_rx));

        info!(
            adapter = NAME,
            backend = %config.backend_addr,
            host_override = ?config.host_override,
            extra_headers = config.headers.len(),
            "adapter started"
        );

        Ok(Self {
            config,
            bridge,
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        Self::new(AdapterConfig::from_params(params)?)
    }

    /// Hand over a connection the dispatcher has already set up.
    ///
    /// `preread` holds any bytes the dispatcher consumed while routing; they
    /// are replayed ahead of the stream so the TLS handshake sees the full
    /// ClientHello. Never blocks; a connection handed over after close is
    /// dropped.
    pub fn handle<S: Io>(&self, conn: S, meta: ConnMeta, preread: Bytes) {
        let boxed: Box<dyn Io> = Box::new(conn);
        self.bridge.put_conn(PrefixedStream::new(preread, boxed), meta);
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Stop accepting, release the bridge and wait for the accept loop to
    /// exit. Returns the first error encountered.
    ///
    /// Connections already being served are asked to shut down gracefully:
    /// an in-flight request completes, idle connections close. This call
    /// does not wait for them.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut first_err = self.bridge.close().err();

        let pending = self.bridge.take_pending();
        if !pending.is_empty() {
            debug!(count = pending.len(), "dropping never-accepted connections");
        }
        drop(pending);

        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(server) = server {
            let outcome = match server.await {
                Ok(result) => result,
                Err(e) => Err(Error::Io(io::Error::other(e))),
            };
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }

        info!(adapter = NAME, "adapter closed");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        let _ = self.bridge.close();
    }
}
