//! Notifications raised by the relay and the config proxy for their owner.

use tokio::sync::mpsc;

/// Real chat server the client would have connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDestination {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A relay session ended. Fired once per session.
    ConnectionLost,
    /// A config fetch revealed where the client wanted to connect.
    ChatDestinationResolved(ChatDestination),
    /// Something the user has to be told about. `fatal` alerts end the process.
    Alert { message: String, fatal: bool },
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

pub fn channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::unbounded_channel()
}
