use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::error::{Error, Result};

/// A loaded certificate chain and private key, optionally paired with a
/// trust pool of CA certificates.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Option<RootCertStore>,
}

impl TlsIdentity {
    /// Read the certificate chain, private key and optional CA bundle from disk.
    ///
    /// Any unreadable or unparseable file is an [`Error::IdentityLoad`],
    /// including the CA bundle: custom trust is never silently dropped.
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: Option<&Path>) -> Result<Self> {
        let cert_pem = read_pem(cert_path, "certificate")?;
        let key_pem = read_pem(key_path, "private key")?;
        let ca_pem = ca_path.map(|p| read_pem(p, "CA bundle")).transpose()?;

        debug!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            has_ca = ca_path.is_some(),
            "loading TLS identity"
        );

        Self::from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
    }

    /// Parse a PEM certificate chain, private key and optional CA bundle.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: Option<&[u8]>) -> Result<Self> {
        let certs = parse_certs(cert_pem, "certificate")?;

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| Error::IdentityLoad(format!("failed to parse private key PEM: {e}")))?
            .ok_or_else(|| Error::IdentityLoad("no private key found in PEM".into()))?;

        let roots = match ca_pem {
            Some(pem) => {
                let mut store = RootCertStore::empty();
                for cert in parse_certs(pem, "CA bundle")? {
                    store
                        .add(cert)
                        .map_err(|e| Error::IdentityLoad(format!("invalid CA certificate: {e}")))?;
                }
                Some(store)
            }
            None => None,
        };

        Ok(Self { certs, key, roots })
    }

    /// Whether a custom trust pool was loaded.
    pub fn has_trust_pool(&self) -> bool {
        self.roots.is_some()
    }

    /// Server-side configuration: presents this identity, requires no client
    /// certificate.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("unsupported protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| Error::IdentityLoad(format!("failed to build TLS server config: {e}")))?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Client-side configuration: presents this identity as a client
    /// certificate and verifies the peer against the trust pool, or against
    /// the Mozilla root set when no pool was loaded.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let roots = match &self.roots {
            Some(roots) => roots.clone(),
            None => RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        };

        ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("unsupported protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| Error::IdentityLoad(format!("failed to build TLS client config: {e}")))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::IdentityLoad(format!("failed to read {what} '{}': {e}", path.display())))
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::IdentityLoad(format!("failed to parse {what} PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::IdentityLoad(format!("no certificates found in {what} PEM")));
    }
    Ok(certs)
}
