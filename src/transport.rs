//! Transport seam and the mutual-TLS connector
//!
//! The client core only needs an async byte stream; `Transport` is a
//! blanket trait so tests run over `tokio::io::duplex` and production
//! code hands in a TLS stream. `connect_tls` covers the common managed
//! broker setup: client certificate plus key, optional private CA.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{MqttError, MqttResult};

/// Any async byte stream the client can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Paths for mutual-TLS authentication
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Broker CA bundle; when absent the webpki root store is used
    pub ca_file: Option<PathBuf>,
}

/// Open a mutual-TLS connection to `host:port`.
pub async fn connect_tls(
    settings: &TlsSettings,
    host: &str,
    port: u16,
) -> MqttResult<TlsStream<TcpStream>> {
    let certs = load_certs(&settings.cert_file)?;
    let key = load_key(&settings.key_file)?;

    let mut roots = RootCertStore::empty();
    match &settings.ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| MqttError::Tls(format!("invalid CA certificate: {e}")))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| MqttError::Tls(format!("client certificate setup failed: {e}")))?;
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| MqttError::Tls(format!("invalid server name {host:?}")))?;

    debug!(host, port, "opening TLS connection");
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| MqttError::TransportLost(e.to_string()))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| MqttError::Tls(e.to_string()))?;
    Ok(stream)
}

fn load_certs(path: &Path) -> MqttResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| MqttError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| MqttError::Tls(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(MqttError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> MqttResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| MqttError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| MqttError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| MqttError::Tls(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_certs_missing_file() {
        let result = load_certs(Path::new("/nonexistent/client.pem"));
        assert!(matches!(result, Err(MqttError::Tls(_))));
    }

    #[test]
    fn test_load_certs_empty_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let result = load_certs(file.path());

        assert!(matches!(result, Err(MqttError::Tls(_))));
    }

    #[test]
    fn test_load_key_without_key_block() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(file, "aGVsbG8=").unwrap();
        writeln!(file, "-----END CERTIFICATE-----").unwrap();

        let result = load_key(file.path());

        assert!(matches!(result, Err(MqttError::Tls(_))));
    }
}
