//! Message records relayed between participants.
//!
//! The relay never persists or mutates these; read/unread state and history
//! belong to the directory and persistence service.

mod envelope;
mod notification;

pub use envelope::{
    Envelope, MessageType, ParseEnumError, Priority, ReceiverType, RelatedEntity,
    RelatedEntityType, SenderType,
};
pub use notification::{Notification, NotificationKind};

use serde::{Deserialize, Serialize};

/// What travels over the broker and what listeners receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum Payload {
    Message(Envelope),
    Notification(Notification),
}

impl Payload {
    /// Subject for messages, title for notifications.
    pub fn subject(&self) -> &str {
        match self {
            Payload::Message(envelope) => &envelope.subject,
            Payload::Notification(notification) => &notification.title,
        }
    }

    pub fn as_message(&self) -> Option<&Envelope> {
        match self {
            Payload::Message(envelope) => Some(envelope),
            Payload::Notification(_) => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Payload::Notification(notification) => Some(notification),
            Payload::Message(_) => None,
        }
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl From<Envelope> for Payload {
    fn from(envelope: Envelope) -> Self {
        Payload::Message(envelope)
    }
}

impl From<Notification> for Payload {
    fn from(notification: Notification) -> Self {
        Payload::Notification(notification)
    }
}
