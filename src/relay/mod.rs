//! Client ↔ chat server stanza relay.
//!
//! The relay sits between two already-established duplex streams: one to the
//! local chat client and one to the real chat server. Server traffic is copied
//! to the client untouched. Client traffic is inspected chunk by chunk and
//! presence stanzas are rewritten before they reach the server.

pub mod acceptor;
pub mod presence;
pub mod stanza;
mod tls;

pub use acceptor::{bind_acceptor, run_acceptor, AcceptorConfig};
pub use presence::Visibility;
pub use tls::init_crypto_provider;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::events::{Notification, NotificationSender};
use presence::rewrite_presence;

/// Read size for both pump directions. A stanza split across two reads is
/// not reassembled.
const READ_CHUNK_SIZE: usize = 8192;

/// Contact id that used to be injected into the roster. Anything mentioning it
/// must never reach the server.
const SYNTHETIC_CONTACT: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8@eu1.pvp.net";

/// Upper bound on flushing the server write half once the session ends.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Monotonic session id for correlating relay logs across tasks.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// User-controlled relay settings, shared by the controller and every session.
///
/// Plain atomics: writers never block readers, and a pump that reads a stale
/// value is corrected by the next presence it sees or by a replay.
#[derive(Debug)]
pub struct Settings {
    enabled: AtomicBool,
    lobby_chat: AtomicBool,
    visibility: AtomicU8,
}

impl Settings {
    pub fn new(visibility: Visibility, lobby_chat: bool) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            lobby_chat: AtomicBool::new(lobby_chat),
            visibility: AtomicU8::new(visibility.as_u8()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn lobby_chat(&self) -> bool {
        self.lobby_chat.load(Ordering::SeqCst)
    }

    pub fn set_lobby_chat(&self, lobby_chat: bool) {
        self.lobby_chat.store(lobby_chat, Ordering::SeqCst);
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_u8(self.visibility.load(Ordering::SeqCst))
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.store(visibility.as_u8(), Ordering::SeqCst);
    }

    /// Visibility actually applied to outgoing presence.
    pub fn effective_visibility(&self) -> Visibility {
        if self.enabled() {
            self.visibility()
        } else {
            Visibility::Online
        }
    }
}

/// Why a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    ClientClosed,
    ClientReadError,
    ClientWriteError,
    ServerClosed,
    ServerReadError,
    ServerWriteError,
    ClosedByOwner,
    TaskFailed,
}

struct SessionState {
    id: u64,
    connected: AtomicBool,
    last_presence: std::sync::Mutex<Option<String>>,
    settings: Arc<Settings>,
    upstream: Mutex<BoxedWriter>,
    notifications: NotificationSender,
}

impl SessionState {
    fn last_presence(&self) -> Option<String> {
        self.last_presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember_presence(&self, content: &str) {
        *self
            .last_presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(content.to_string());
    }

    async fn write_upstream(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.upstream.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Classify one client chunk and forward whatever should reach the server.
    async fn handle_client_chunk(&self, chunk: &[u8]) -> std::io::Result<()> {
        let content = String::from_utf8_lossy(chunk);

        if content.contains("<presence") && self.settings.enabled() {
            debug!(conn_id = self.id, data = %content, "Client->Server presence (original)");
            self.rewrite_and_forward(&content, self.settings.visibility())
                .await
        } else if content.contains(SYNTHETIC_CONTACT) {
            debug!(conn_id = self.id, data = %content, "Client->Server dropped (synthetic contact)");
            Ok(())
        } else {
            debug!(conn_id = self.id, data = %content, "Client->Server");
            self.write_upstream(chunk).await
        }
    }

    /// Cache `content` as the latest presence, rewrite it for `target` and send
    /// the result. A rewrite failure drops the chunk and alerts the user; only
    /// write errors are returned.
    async fn rewrite_and_forward(&self, content: &str, target: Visibility) -> std::io::Result<()> {
        self.remember_presence(content);

        match rewrite_presence(content, target, self.settings.lobby_chat()) {
            Ok(rewritten) => {
                debug!(conn_id = self.id, data = %rewritten, visibility = %target, "Client->Server presence (rewritten)");
                if rewritten.is_empty() {
                    return Ok(());
                }
                self.write_upstream(rewritten.as_bytes()).await
            }
            Err(e) => {
                error!(conn_id = self.id, error = %e, "Failed to rewrite presence, dropping chunk");
                let _ = self.notifications.send(Notification::Alert {
                    message: format!("Unable to rewrite an outgoing presence update: {}", e),
                    fatal: false,
                });
                Ok(())
            }
        }
    }

    /// Mark the session dead. Only the first call raises `ConnectionLost`.
    fn invalidate(&self, reason: EndReason) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(conn_id = self.id, reason = ?reason, "Relay session lost");
            let _ = self.notifications.send(Notification::ConnectionLost);
        }
    }
}

/// Control handle for a running relay session.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.state.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RelayHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Rewrite the last presence seen from the client with `target` and send it
    /// again, so a visibility change takes effect without waiting for traffic.
    ///
    /// Returns `Ok(false)` when there is nothing to replay.
    pub async fn replay_presence(&self, target: Visibility) -> std::io::Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let Some(last) = self.state.last_presence() else {
            return Ok(false);
        };
        self.state.rewrite_and_forward(&last, target).await?;
        Ok(true)
    }

    /// Tear the session down. Raises `ConnectionLost` like any other ending.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Start relaying between `client` and `server`.
///
/// Spawns the two pump tasks plus a supervisor that ends the session as soon
/// as either direction stops.
pub fn start_relay<C, S>(
    client: C,
    server: S,
    settings: Arc<Settings>,
    notifications: NotificationSender,
) -> RelayHandle
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let state = Arc::new(SessionState {
        id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        connected: AtomicBool::new(true),
        last_presence: std::sync::Mutex::new(None),
        settings,
        upstream: Mutex::new(Box::new(server_write)),
        notifications,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(supervise(
        client_read,
        client_write,
        server_read,
        state.clone(),
        shutdown_rx,
    ));

    RelayHandle {
        state,
        shutdown: Arc::new(shutdown_tx),
    }
}

async fn supervise<CR, CW, SR>(
    client_read: CR,
    client_write: CW,
    server_read: SR,
    state: Arc<SessionState>,
    mut shutdown: watch::Receiver<bool>,
) where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
{
    let started = Instant::now();
    let conn_id = state.id;
    info!(conn_id, "Relay started");

    let mut upstream = tokio::spawn(pump_client_to_server(client_read, state.clone()));
    let mut downstream = tokio::spawn(pump_server_to_client(server_read, client_write, conn_id));

    let reason = tokio::select! {
        result = &mut upstream => result.unwrap_or_else(|e| {
            error!(conn_id, error = %e, "Client->Server task join error");
            EndReason::TaskFailed
        }),
        result = &mut downstream => result.unwrap_or_else(|e| {
            error!(conn_id, error = %e, "Server->Client task join error");
            EndReason::TaskFailed
        }),
        // Dropping every handle without calling close() leaves the session running
        Ok(_) = shutdown.wait_for(|closed| *closed) => EndReason::ClosedByOwner,
    };

    upstream.abort();
    downstream.abort();

    // Let the server see the session end instead of a half-open socket.
    let closed = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = state.upstream.lock().await.shutdown().await;
    })
    .await;
    if closed.is_err() {
        debug!(conn_id, "Server stream shutdown timed out");
    }

    state.invalidate(reason);
    info!(
        conn_id,
        reason = ?reason,
        relay_ms = started.elapsed().as_millis() as u64,
        "Relay ended"
    );
}

async fn pump_client_to_server<R>(mut reader: R, state: Arc<SessionState>) -> EndReason
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!(conn_id = state.id, "Client stream closed");
                return EndReason::ClientClosed;
            }
            Ok(n) => {
                if let Err(e) = state.handle_client_chunk(&buf[..n]).await {
                    warn!(conn_id = state.id, error = %e, "Client->Server write error");
                    return EndReason::ServerWriteError;
                }
            }
            Err(e) => {
                warn!(conn_id = state.id, error = %e, "Client read error");
                return EndReason::ClientReadError;
            }
        }
    }
}

async fn pump_server_to_client<R, W>(mut reader: R, mut writer: W, conn_id: u64) -> EndReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!(conn_id, "Server stream closed");
                return EndReason::ServerClosed;
            }
            Ok(n) => {
                debug!(conn_id, data = %String::from_utf8_lossy(&buf[..n]), "Server->Client");
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    warn!(conn_id, error = %e, "Server->Client write error");
                    return EndReason::ClientWriteError;
                }
                if let Err(e) = writer.flush().await {
                    warn!(conn_id, error = %e, "Server->Client flush error");
                    return EndReason::ClientWriteError;
                }
            }
            Err(e) => {
                warn!(conn_id, error = %e, "Server read error");
                return EndReason::ServerReadError;
            }
        }
    }
}
