use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderValue};
use http::request::Parts;
use http::uri::{Authority, Scheme, Uri};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use tracing::{debug, warn};

use crate::config::AdapterConfig;
use crate::error::Result;
use crate::stream::ConnMeta;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body handed back to the inbound connection.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request destination and header rewrites.
#[derive(Debug, Clone)]
pub struct Rewrite {
    backend: Authority,
    host_override: Option<HeaderValue>,
    headers: HeaderMap,
}

impl Rewrite {
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            backend: config.backend_addr.clone(),
            host_override: config.host_override.clone(),
            headers: config.headers.clone(),
        }
    }

    /// Point the request at the backend over https and apply header rules.
    ///
    /// The original Host header is kept unless an override is configured.
    pub fn apply(&self, parts: &mut Parts, peer: Option<SocketAddr>) -> http::Result<()> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = Uri::builder()
            .scheme(Scheme::HTTPS)
            .authority(self.backend.clone())
            .path_and_query(path_and_query)
            .build()?;

        let wants_trailers = parts
            .headers
            .get_all(header::TE)
            .iter()
            .any(|v| has_token(v, "trailers"));
        strip_hop_by_hop(&mut parts.headers);
        if wants_trailers {
            parts
                .headers
                .insert(header::TE, HeaderValue::from_static("trailers"));
        }

        if let Some(host) = &self.host_override {
            parts.headers.insert(header::HOST, host.clone());
        }
        for (name, value) in &self.headers {
            parts.headers.insert(name.clone(), value.clone());
        }

        if let Some(peer) = peer {
            append_forwarded_for(&mut parts.headers, peer);
        }
        Ok(())
    }
}

/// Forwards rewritten requests to the backend over mutual TLS.
pub struct Forwarder {
    client: reqwest::Client,
    rewrite: Rewrite,
}

impl Forwarder {
    /// `tls` is the client identity presented to the backend together with
    /// the trust pool its certificate is verified against.
    pub fn new(config: &AdapterConfig, tls: rustls::ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            rewrite: Rewrite::from_config(config),
        })
    }

    /// Forward one request. Backend failures become a `502 Bad Gateway`.
    pub async fn forward(&self, req: Request<Incoming>, meta: ConnMeta) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        if let Err(e) = self.rewrite.apply(&mut parts, meta.peer_addr) {
            debug!(uri = %parts.uri, error = %e, "cannot rewrite request target");
            return error_response(StatusCode::BAD_REQUEST, "bad request target\n");
        }

        let mut request = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers);
        if !body.is_end_stream() {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        match request.send().await {
            Ok(response) => {
                debug!(
                    backend = %self.rewrite.backend,
                    status = response.status().as_u16(),
                    "backend responded"
                );
                into_proxy_response(response)
            }
            Err(e) => {
                warn!(backend = %self.rewrite.backend, error = %e, "backend request failed");
                error_response(StatusCode::BAD_GATEWAY, "bad gateway\n")
            }
        }
    }
}

fn into_proxy_response(response: reqwest::Response) -> Response<ProxyBody> {
    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let stream = response
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as BoxError);
    let mut proxied = Response::new(StreamBody::new(stream).boxed_unsync());
    *proxied.status_mut() = status;
    *proxied.headers_mut() = headers;
    proxied
}

pub fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }
}

fn has_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let mut chain: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_owned)
        .collect();
    chain.push(peer.ip().to_string());

    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
