use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::uri::Authority;

use crate::error::{Error, Result};
use crate::proxy::tls_acceptor::HANDSHAKE_TIMEOUT;

pub const CRT_PATH: &str = "plugin_crt_path";
pub const KEY_PATH: &str = "plugin_key_path";
pub const BACKEND_CA_PATH: &str = "plugin_local_server_ca_path";
pub const BACKEND_CRT_PATH: &str = "plugin_local_server_crt_path";
pub const BACKEND_KEY_PATH: &str = "plugin_local_server_key_path";
pub const BACKEND_ADDR: &str = "plugin_local_addr";
pub const HOST_HEADER_REWRITE: &str = "plugin_host_header_rewrite";
pub const HEADER_PREFIX: &str = "plugin_header_";

const ENV_PREFIX: &str = "PLUGIN_";

/// Validated adapter settings. Immutable once built.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Certificate presented to inbound TLS clients.
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
    /// Trust pool for the backend's server certificate.
    pub backend_ca_path: PathBuf,
    /// Client certificate presented to the backend.
    pub backend_cert_path: PathBuf,
    pub backend_key_path: PathBuf,
    pub backend_addr: Authority,
    pub host_override: Option<HeaderValue>,
    /// Injected into every forwarded request, replacing same-named headers.
    pub headers: HeaderMap,
    /// Not a plugin parameter; defaults to 10s.
    pub handshake_timeout: Duration,
}

impl AdapterConfig {
    /// Build from plugin parameters.
    ///
    /// Required parameters are checked in a fixed order and the first missing
    /// or empty one is named in the error.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let server_cert_path = required(params, CRT_PATH)?;
        let server_key_path = required(params, KEY_PATH)?;
        let backend_ca_path = required(params, BACKEND_CA_PATH)?;
        let backend_cert_path = required(params, BACKEND_CRT_PATH)?;
        let backend_key_path = required(params, BACKEND_KEY_PATH)?;

        let backend_addr: Authority = required(params, BACKEND_ADDR)?
            .parse()
            .map_err(|e| Error::Config(format!("invalid {BACKEND_ADDR}: {e}")))?;

        let host_override = params
            .get(HOST_HEADER_REWRITE)
            .filter(|v| !v.is_empty())
            .map(|v| HeaderValue::from_str(v))
            .transpose()
            .map_err(|e| Error::Config(format!("invalid {HOST_HEADER_REWRITE}: {e}")))?;

        let mut headers = HeaderMap::new();
        for (key, value) in params {
            let Some(name) = key.strip_prefix(HEADER_PREFIX) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name in {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid header value in {key}: {e}")))?;
            if headers.contains_key(&name) {
                return Err(Error::Config(format!(
                    "header {name} is configured more than once"
                )));
            }
            headers.insert(name, value);
        }

        Ok(Self {
            server_cert_path: server_cert_path.into(),
            server_key_path: server_key_path.into(),
            backend_ca_path: backend_ca_path.into(),
            backend_cert_path: backend_cert_path.into(),
            backend_key_path: backend_key_path.into(),
            backend_addr,
            host_override,
            headers,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }
}

/// Settings for the standalone dispatcher binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_format: LogFormat,
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8443".into())
            .parse()
            .map_err(|e| Error::Config(format!("invalid LISTEN_ADDR: {e}")))?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "json".into())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => {
                return Err(Error::Config(format!(
                    "invalid LOG_FORMAT '{other}': must be 'json' or 'pretty'"
                )))
            }
        };

        let params_file = env::var("PLUGIN_PARAMS_FILE").ok().map(PathBuf::from);
        let params = plugin_params(params_file.as_deref(), env::vars())?;
        let adapter = AdapterConfig::from_params(&params)?;

        Ok(Config {
            listen_addr,
            log_format,
            adapter,
        })
    }
}

/// Merge plugin parameters from an optional JSON file with `PLUGIN_*`
/// variables; variables win.
///
/// Variable names are lower-cased, and underscores in a header suffix become
/// dashes (`PLUGIN_HEADER_X_TENANT` sets `x-tenant`).
pub fn plugin_params<I>(file: Option<&Path>, vars: I) -> Result<HashMap<String, String>>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut params: HashMap<String, String> = match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("failed to read PLUGIN_PARAMS_FILE '{}': {e}", path.display()))
            })?;
            serde_json::from_str(&raw)?
        }
        None => HashMap::new(),
    };

    for (key, value) in vars {
        if key == "PLUGIN_PARAMS_FILE" || !key.starts_with(ENV_PREFIX) {
            continue;
        }
        let key = key.to_lowercase();
        let key = match key.strip_prefix(HEADER_PREFIX) {
            Some(name) => format!("{HEADER_PREFIX}{}", name.replace('_', "-")),
            None => key,
        };
        params.retain(|existing, _| !existing.eq_ignore_ascii_case(&key));
        params.insert(key, value);
    }

    Ok(params)
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    match params.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{key} is required"))),
    }
}
