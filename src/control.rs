//! User commands applied to the shared settings and the live relay session.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::events::{ChatDestination, Notification};
use crate::relay::{RelayHandle, Settings, Visibility};
use crate::status_store::StatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    SetVisibility(Visibility),
    Enable,
    Disable,
    Toggle,
    LobbyChat(bool),
    Close,
    Status,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: lobby on|off")]
    LobbyArgument,
}

impl FromStr for ControlCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let Some(command) = words.next() else {
            return Err(CommandError::Empty);
        };
        let command = command.to_ascii_lowercase();

        match command.as_str() {
            "online" | "chat" => Ok(Self::SetVisibility(Visibility::Online)),
            "offline" => Ok(Self::SetVisibility(Visibility::Offline)),
            "mobile" => Ok(Self::SetVisibility(Visibility::Mobile)),
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            "toggle" => Ok(Self::Toggle),
            "lobby" => match words.next().map(str::to_ascii_lowercase).as_deref() {
                Some("on") => Ok(Self::LobbyChat(true)),
                Some("off") => Ok(Self::LobbyChat(false)),
                _ => Err(CommandError::LobbyArgument),
            },
            "close" => Ok(Self::Close),
            "status" => Ok(Self::Status),
            "quit" | "exit" => Ok(Self::Quit),
            _ => Err(CommandError::Unknown(command)),
        }
    }
}

/// What the console should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Continue(String),
    Quit,
}

/// How long a fatal alert waits before shutting down. The config proxy
/// raises it while still answering the client, and that response has to
/// flush first.
const FATAL_ALERT_GRACE: Duration = Duration::from_millis(500);

/// What the owner loop should do after a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Continue,
    Exit(String),
}

pub struct Controller {
    settings: Arc<Settings>,
    store: StatusStore,
    session: Mutex<Option<RelayHandle>>,
}

impl Controller {
    pub fn new(settings: Arc<Settings>, store: StatusStore) -> Self {
        Self {
            settings,
            store,
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Make `handle` the session that commands act on.
    pub fn attach(&self, handle: RelayHandle) {
        info!(conn_id = handle.id(), "Controller attached to relay session");
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn current_session(&self) -> Option<RelayHandle> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(RelayHandle::is_connected)
    }

    /// Save the chosen visibility. Failures are logged only.
    pub fn persist(&self) {
        let visibility = self.settings.visibility();
        if let Err(e) = self.store.save(visibility) {
            warn!(path = %self.store.path().display(), error = %e, "Failed to save status");
        }
    }

    async fn replay(&self, target: Visibility) {
        let Some(session) = self.current_session() else {
            return;
        };
        match session.replay_presence(target).await {
            Ok(true) => info!(conn_id = session.id(), visibility = %target, "Replayed presence"),
            Ok(false) => {}
            Err(e) => warn!(conn_id = session.id(), error = %e, "Failed to replay presence"),
        }
    }

    pub fn status_line(&self) -> String {
        let session = match self.current_session() {
            Some(session) => format!("connected (session {})", session.id()),
            None => "no chat session".to_string(),
        };
        format!(
            "visibility: {}, enabled: {}, lobby chat: {}, {}",
            self.settings.visibility(),
            self.settings.enabled(),
            if self.settings.lobby_chat() { "on" } else { "off" },
            session
        )
    }

    /// React to an event from the relay or the config proxy. A resolved
    /// destination is published on `destinations` for the chat acceptor.
    pub async fn handle_notification(
        &self,
        notification: Notification,
        destinations: &watch::Sender<Option<ChatDestination>>,
    ) -> NotificationOutcome {
        match notification {
            Notification::ConnectionLost => {
                warn!("Chat session lost");
                println!("Chat session lost. Restart the client to reconnect.");
                self.persist();
            }
            Notification::ChatDestinationResolved(destination) => {
                info!(host = %destination.host, port = destination.port, "Chat destination updated");
                destinations.send_replace(Some(destination));
            }
            Notification::Alert { message, fatal: false } => {
                error!(message = %message, "Alert");
                eprintln!("Error: {}", message);
            }
            Notification::Alert { message, fatal: true } => {
                error!(message = %message, "Fatal alert, shutting down");
                self.persist();
                tokio::time::sleep(FATAL_ALERT_GRACE).await;
                return NotificationOutcome::Exit(message);
            }
        }
        NotificationOutcome::Continue
    }

    pub async fn apply(&self, command: ControlCommand) -> Reply {
        match command {
            ControlCommand::SetVisibility(visibility) => {
                self.settings.set_visibility(visibility);
                self.settings.set_enabled(true);
                self.persist();
                self.replay(visibility).await;
                Reply::Continue(format!("now appearing as {}", visibility))
            }
            ControlCommand::Enable | ControlCommand::Disable | ControlCommand::Toggle => {
                let enabled = match command {
                    ControlCommand::Enable => true,
                    ControlCommand::Disable => false,
                    _ => !self.settings.enabled(),
                };
                self.settings.set_enabled(enabled);
                self.replay(self.settings.effective_visibility()).await;
                Reply::Continue(if enabled {
                    format!("masking enabled, appearing as {}", self.settings.visibility())
                } else {
                    "masking disabled, showing real presence".to_string()
                })
            }
            ControlCommand::LobbyChat(on) => {
                self.settings.set_lobby_chat(on);
                Reply::Continue(format!("lobby chat {}", if on { "on" } else { "off" }))
            }
            ControlCommand::Close => match self.current_session() {
                Some(session) => {
                    session.close();
                    Reply::Continue(format!("closing session {}", session.id()))
                }
                None => Reply::Continue("no chat session to close".to_string()),
            },
            ControlCommand::Status => Reply::Continue(self.status_line()),
            ControlCommand::Quit => {
                self.persist();
                Reply::Quit
            }
        }
    }
}
