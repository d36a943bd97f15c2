//! Loopback listener that the chat client connects to.
//!
//! Each accepted connection completes its TLS handshake, waits until a config
//! fetch has told us where the client really wanted to go, dials that server
//! and hands both streams to a new relay session.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use super::tls::{connect_upstream, load_tls_acceptor};
use super::{start_relay, RelayHandle, Settings};
use crate::events::{ChatDestination, NotificationSender};

/// How long an accepted client may wait for the config proxy to report the
/// real chat destination before we give up on it.
const DESTINATION_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Timeout for the client-facing TLS handshake.
const CLIENT_HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Skip certificate verification when dialing the real chat server.
    pub insecure_upstream: bool,
}

/// Bind the loopback chat listener. Port 0 picks an ephemeral port.
pub async fn bind_acceptor(port: u16) -> Result<TcpListener, String> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| format!("Failed to bind chat listener on 127.0.0.1:{}: {}", port, e))
}

/// Accept chat clients until the listener fails.
///
/// Every established relay is reported on `sessions` so the controller can
/// drive it.
pub async fn run_acceptor(
    listener: TcpListener,
    config: AcceptorConfig,
    destinations: watch::Receiver<Option<ChatDestination>>,
    settings: Arc<Settings>,
    notifications: NotificationSender,
    sessions: mpsc::UnboundedSender<RelayHandle>,
) -> Result<(), String> {
    let tls_acceptor = load_tls_acceptor(&config.cert_path, &config.key_path)?;

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| format!("Chat listener accept failed: {}", e))?;
        info!(addr = %addr, "New chat client connection");

        let tls_acceptor = tls_acceptor.clone();
        let destinations = destinations.clone();
        let settings = settings.clone();
        let notifications = notifications.clone();
        let sessions = sessions.clone();
        let insecure = config.insecure_upstream;

        tokio::spawn(async move {
            match establish(stream, tls_acceptor, destinations, insecure).await {
                Ok((client, server)) => {
                    let handle = start_relay(client, server, settings, notifications);
                    info!(conn_id = handle.id(), "Relay session established");
                    let _ = sessions.send(handle);
                }
                Err(e) => error!(addr = %addr, error = %e, "Failed to establish relay session"),
            }
        });
    }
}

async fn establish(
    stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    mut destinations: watch::Receiver<Option<ChatDestination>>,
    insecure: bool,
) -> Result<
    (
        tokio_rustls::server::TlsStream<TcpStream>,
        tokio_rustls::client::TlsStream<TcpStream>,
    ),
    String,
> {
    let _ = stream.set_nodelay(true);
    let client = tokio::time::timeout(CLIENT_HANDSHAKE_TIMEOUT, tls_acceptor.accept(stream))
        .await
        .map_err(|_| "Client TLS handshake timed out".to_string())?
        .map_err(|e| format!("Client TLS handshake failed: {}", e))?;

    let destination = wait_for_destination(&mut destinations, DESTINATION_WAIT_TIMEOUT).await?;
    info!(host = %destination.host, port = destination.port, "Dialing real chat server");

    let server = connect_upstream(&destination, insecure).await?;
    Ok((client, server))
}

/// Wait for the config proxy to publish a chat destination.
async fn wait_for_destination(
    destinations: &mut watch::Receiver<Option<ChatDestination>>,
    timeout: std::time::Duration,
) -> Result<ChatDestination, String> {
    let waited = tokio::time::timeout(timeout, destinations.wait_for(Option::is_some)).await;
    match waited {
        Ok(Ok(current)) => current
            .clone()
            .ok_or_else(|| "Chat destination disappeared".to_string()),
        Ok(Err(_)) => Err("Config proxy stopped before a chat destination was known".to_string()),
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "No chat destination resolved, was the client started through the config proxy?"
            );
            Err(format!(
                "Timed out after {}s waiting for the chat destination",
                timeout.as_secs()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn destination() -> ChatDestination {
        ChatDestination {
            host: "euw1.chat.si.riotgames.com".to_string(),
            port: 5223,
        }
    }

    #[tokio::test]
    async fn test_wait_for_destination_already_known() {
        let (_tx, mut rx) = watch::channel(Some(destination()));
        let got = wait_for_destination(&mut rx, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(got, destination());
    }

    #[tokio::test]
    async fn test_wait_for_destination_published_later() {
        let (tx, mut rx) = watch::channel(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(Some(destination()));
            // Keep the sender alive until the receiver has observed the value
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let got = wait_for_destination(&mut rx, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got.port, 5223);
    }

    #[tokio::test]
    async fn test_wait_for_destination_times_out() {
        let (_tx, mut rx) = watch::channel(None);
        let err = wait_for_destination(&mut rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.contains("Timed out"));
    }

    #[tokio::test]
    async fn test_bind_acceptor_ephemeral_port() {
        let listener = bind_acceptor(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_run_acceptor_fails_without_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let listener = bind_acceptor(0).await.unwrap();
        let (_dest_tx, dest_rx) = watch::channel(None);
        let (tx, _rx) = crate::events::channel();
        let (sessions_tx, _sessions_rx) = mpsc::unbounded_channel();
        let config = AcceptorConfig {
            cert_path: dir.path().join("missing.pem"),
            key_path: dir.path().join("missing.key"),
            insecure_upstream: false,
        };
        let settings = Arc::new(Settings::new(crate::relay::Visibility::Offline, true));
        let result = run_acceptor(listener, config, dest_rx, settings, tx, sessions_tx).await;
        assert!(result.is_err());
    }
}
