//! TLS plumbing for both ends of a relay session.
//!
//! The client-facing side terminates TLS with a certificate supplied on the
//! command line (the client config rewrite tells the client to accept it).
//! The server-facing side dials the real chat host with native roots.

use std::io;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info, warn};

use crate::events::ChatDestination;

/// Bound on the outbound TCP connect. OS defaults for an unreachable host can
/// run to minutes while the client sits on its loading screen.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring provider as the process default. Safe to call repeatedly.
pub fn init_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts whatever certificate the chat server presents. Signatures are
/// still checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algorithms = &self.provider.signature_verification_algorithms;
        rustls::crypto::verify_tls12_signature(message, cert, dss, algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algorithms = &self.provider.signature_verification_algorithms;
        rustls::crypto::verify_tls13_signature(message, cert, dss, algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn native_roots() -> Result<RootCertStore, String> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!(error = %e, "Skipping unreadable system certificate");
    }
    if loaded.certs.is_empty() {
        return Err("No system root certificates found, cannot verify the chat server. \
            Install your platform CA bundle or pass --dangerous-insecure-tls."
            .to_string());
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        warn!(added, ignored, "Some system root certificates were rejected");
    }
    Ok(roots)
}

/// Connector for the server-facing side. `insecure` skips certificate
/// verification.
pub fn upstream_connector(insecure: bool) -> Result<TlsConnector, String> {
    let config = if insecure {
        warn!("Chat server certificate verification is disabled");
        let verifier = AcceptAnyServerCert {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(native_roots()?)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build the acceptor used for the client-facing TLS session from PEM files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, String> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| format!("Failed to open certificate {}: {}", cert_path.display(), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to parse certificate {}: {}", cert_path.display(), e))?;
    if certs.is_empty() {
        return Err(format!("No certificate found in {}", cert_path.display()));
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| format!("Failed to load private key {}: {}", key_path.display(), e))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("Invalid certificate/key pair: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Coarse bucket for a failed client handshake, logged to tell certificate
/// trouble apart from network trouble.
fn handshake_failure_kind(e: &io::Error) -> &'static str {
    let is_tls = e
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some());
    match e.kind() {
        _ if is_tls => "tls",
        io::ErrorKind::TimedOut => "timeout",
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => "connection",
        _ => "other",
    }
}

/// Dial the real chat server over direct TLS.
pub async fn connect_upstream(
    destination: &ChatDestination,
    insecure: bool,
) -> Result<TlsStream<TcpStream>, String> {
    let ChatDestination { host, port } = destination;
    let port = *port;

    let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            error!(host = %host, port, error = %e, "Chat server connect failed");
            return Err(format!("Failed to connect to chat server {}:{}: {}", host, port, e));
        }
        Err(_) => {
            error!(host = %host, port, "Chat server connect timed out");
            return Err(format!(
                "Connecting to chat server {}:{} timed out after {}s",
                host,
                port,
                CONNECT_TIMEOUT.as_secs()
            ));
        }
    };
    let _ = tcp.set_nodelay(true);

    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| format!("'{}' is not a valid TLS server name: {}", host, e))?;
    let stream = upstream_connector(insecure)?
        .connect(server_name, tcp)
        .await
        .map_err(|e| {
            let kind = handshake_failure_kind(&e);
            error!(host = %host, port, error = %e, kind, "Chat server TLS handshake failed");
            format!("TLS handshake with {}:{} failed ({}): {}", host, port, kind, e)
        })?;

    info!(host = %host, port, "Connected to chat server");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_upstream_connector() {
        init_crypto_provider();
        assert!(upstream_connector(true).is_ok());
    }

    #[test]
    fn test_handshake_failure_kind() {
        let tls = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert_eq!(handshake_failure_kind(&tls), "tls");
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(handshake_failure_kind(&reset), "connection");
        let other = io::Error::other("boom");
        assert_eq!(handshake_failure_kind(&other), "other");
    }

    #[test]
    fn test_load_tls_acceptor_missing_files() {
        init_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let err = load_tls_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .expect("missing certificate should fail");
        assert!(err.contains("cert.pem"), "unexpected error: {}", err);
    }

    #[test]
    fn test_load_tls_acceptor_rejects_empty_certificate_file() {
        init_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "not a pem file\n").unwrap();
        let err = load_tls_acceptor(&cert, &dir.path().join("key.pem"))
            .err()
            .expect("empty certificate file should fail");
        assert!(err.contains("No certificate"), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_connect_upstream_refused() {
        init_crypto_provider();
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let destination = ChatDestination {
            host: "127.0.0.1".to_string(),
            port,
        };
        let err = connect_upstream(&destination, true)
            .await
            .err()
            .expect("nothing listens on the port");
        assert!(err.contains("Failed to connect"), "unexpected error: {}", err);
    }
}
