#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use https_bridge::{Adapter, ConnMeta};

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn certs(name: &str) -> Vec<CertificateDer<'static>> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn key(name: &str) -> PrivateKeyDer<'static> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::private_key(&mut &pem[..]).unwrap().unwrap()
}

fn roots(name: &str) -> RootCertStore {
    let mut store = RootCertStore::empty();
    for cert in certs(name) {
        store.add(cert).unwrap();
    }
    store
}

/// Complete, valid plugin parameters pointing at `backend`.
pub fn params(backend: SocketAddr) -> HashMap<String, String> {
    let path = |name: &str| fixture(name).display().to_string();
    HashMap::from([
        ("plugin_crt_path".to_string(), path("server.crt")),
        ("plugin_key_path".to_string(), path("server.key")),
        ("plugin_local_server_ca_path".to_string(), path("ca.crt")),
        ("plugin_local_server_crt_path".to_string(), path("client.crt")),
        ("plugin_local_server_key_path".to_string(), path("client.key")),
        ("plugin_local_addr".to_string(), backend.to_string()),
    ])
}

/// A port nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start an HTTPS backend that requires a client certificate issued by the
/// test CA and echoes what it received.
pub async fn start_backend() -> SocketAddr {
    start_echo_server("backend.crt", "backend.key").await
}

/// Same echo server, but presenting a certificate from an unknown CA.
pub async fn start_rogue_backend() -> SocketAddr {
    start_echo_server("rogue-backend.crt", "rogue-backend.key").await
}

async fn start_echo_server(cert: &str, key_name: &str) -> SocketAddr {
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots("ca.crt")), provider())
        .build()
        .unwrap();
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs(cert), key(key_name))
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(echo))
                    .await;
            });
        }
    });

    addr
}

/// How long `/slow` waits before answering.
pub const SLOW_REPLY: Duration = Duration::from_millis(800);

/// Reflects request headers of interest as `x-echo-*` response headers and
/// the method, path and body as the response body.
///
/// `/redirect` answers `302`, `/hop-headers` answers with hop-by-hop response
/// headers and `/slow` waits [`SLOW_REPLY`] before echoing.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/redirect" => {
            let response = Response::builder()
                .status(StatusCode::FOUND)
                .header("location", "/elsewhere")
                .body(Full::new(Bytes::new()));
            return Ok(response.unwrap());
        }
        "/hop-headers" => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header("connection", "X-Foo")
                .header("x-foo", "hop-only")
                .header("keep-alive", "timeout=5")
                .header("x-kept", "yes")
                .body(Full::new(Bytes::from_static(b"hop")));
            return Ok(response.unwrap());
        }
        "/slow" => tokio::time::sleep(SLOW_REPLY).await,
        _ => {}
    }

    let mut response = Response::builder().status(StatusCode::OK);
    for name in ["host", "x-foo", "x-forwarded-for", "connection"] {
        if let Some(value) = req.headers().get(name) {
            response = response.header(format!("x-echo-{name}"), value.clone());
        }
    }

    let line = format!("{} {}", req.method(), req.uri());
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let text = format!("{line} {}", String::from_utf8_lossy(&body));

    Ok(response.body(Full::new(Bytes::from(text))).unwrap())
}

fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots("ca.crt"))
        .with_no_client_auth();
    Arc::new(config)
}

pub fn peer_meta() -> ConnMeta {
    ConnMeta {
        peer_addr: Some("198.51.100.20:40000".parse().unwrap()),
        local_addr: Some("10.0.0.1:443".parse().unwrap()),
    }
}

/// Hand one end of an in-memory pipe to the adapter and return the other.
pub fn hand_off(adapter: &Adapter) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    adapter.handle(server, peer_meta(), Bytes::new());
    client
}

/// Like [`hand_off`], but the "dispatcher" first consumes the TLS record
/// header and passes it along as preread bytes.
pub fn hand_off_after_sniffing(adapter: Arc<Adapter>) -> DuplexStream {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let mut header = [0u8; 5];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x16, "expected a TLS handshake record");
        adapter.handle(server, peer_meta(), Bytes::copy_from_slice(&header));
    });
    client
}

pub async fn tls_connect(io: DuplexStream) -> std::io::Result<TlsStream<DuplexStream>> {
    let name = ServerName::try_from("localhost").unwrap();
    TlsConnector::from(client_config()).connect(name, io).await
}

/// An HTTP/1.1 client session over a TLS connection to the adapter.
pub struct Session {
    sender: hyper::client::conn::http1::SendRequest<Full<Bytes>>,
    driver: JoinHandle<hyper::Result<()>>,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Session {
    pub async fn open(io: DuplexStream) -> Session {
        let tls = tls_connect(io).await.unwrap();
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .unwrap();
        let driver = tokio::spawn(conn);
        Session { sender, driver }
    }

    /// Resolves once the adapter has closed the connection. Holds the sender
    /// until then.
    pub async fn closed(self) {
        let _ = self.driver.await;
    }

    pub async fn send(&mut self, req: Request<Full<Bytes>>) -> Reply {
        let response = self.sender.send_request(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        Reply {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        }
    }

    pub async fn get(&mut self, path: &str, host: &str) -> Reply {
        let req = Request::builder()
            .uri(path)
            .header("host", host)
            .body(Full::new(Bytes::new()))
            .unwrap();
        self.send(req).await
    }
}

/// In-memory sink for JSON log lines emitted while a test runs.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
