//! The message envelope and its closed vocabularies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unknown value for one of the envelope vocabularies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a wire enum with upper-case names and case-insensitive parsing.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($label:literal) { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $label,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// Who sent a message.
    SenderType("sender type") {
        Student => "STUDENT",
        Teacher => "TEACHER",
        Admin => "ADMIN",
        Responsable => "RESPONSABLE",
        System => "SYSTEM",
    }
}

wire_enum! {
    /// Who a message is for. `All` targets every participant type.
    ReceiverType("receiver type") {
        Student => "STUDENT",
        Teacher => "TEACHER",
        Admin => "ADMIN",
        Responsable => "RESPONSABLE",
        All => "ALL",
    }
}

wire_enum! {
    MessageType("message type") {
        Message => "MESSAGE",
        Announcement => "ANNOUNCEMENT",
        Alert => "ALERT",
        Notification => "NOTIFICATION",
        Broadcast => "BROADCAST",
    }
}

wire_enum! {
    Priority("priority") {
        Low => "LOW",
        Medium => "MEDIUM",
        High => "HIGH",
        Urgent => "URGENT",
    }
}

wire_enum! {
    /// Kind of record a message refers to.
    RelatedEntityType("related entity type") {
        Grade => "GRADE",
        Exam => "EXAM",
        Program => "PROGRAM",
        Registration => "REGISTRATION",
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// Broker priority on the 0-9 scale. Medium is 4, the broker default.
    pub fn broker_priority(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 4,
            Priority::High => 7,
            Priority::Urgent => 9,
        }
    }
}

/// Reference to a record owned by the directory and persistence service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntity {
    pub entity_type: RelatedEntityType,
    pub id: i64,
}

/// A point-to-point or broadcast message.
///
/// Immutable once handed to the producer cache; the relay only reads it to
/// derive headers and the time-to-live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Assigned by the persistence service, carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub receiver_id: i64,
    pub receiver_type: ReceiverType,
    pub subject: String,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_entity: Option<RelatedEntity>,
}

impl Envelope {
    /// Create an unread, medium-priority envelope stamped with the current time.
    pub fn new(
        sender: (SenderType, i64),
        receiver: (ReceiverType, i64),
        subject: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id: None,
            sender_id: sender.1,
            sender_type: sender.0,
            receiver_id: receiver.1,
            receiver_type: receiver.0,
            subject: subject.into(),
            content: content.into(),
            message_type,
            priority: Priority::default(),
            is_read: false,
            created_at: Utc::now(),
            expires_at: None,
            related_entity: None,
        }
    }

    pub fn with_message_id(mut self, id: i64) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_related_entity(mut self, entity_type: RelatedEntityType, id: i64) -> Self {
        self.related_entity = Some(RelatedEntity { entity_type, id });
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Envelope {
        Envelope::new(
            (SenderType::Teacher, 12),
            (ReceiverType::Student, 42),
            "Exam moved",
            "The exam is now on Friday",
            MessageType::Announcement,
        )
    }

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = sample();
        assert_eq!(envelope.priority, Priority::Medium);
        assert!(!envelope.is_read);
        assert!(envelope.message_id.is_none());
        assert!(envelope.related_entity.is_none());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("student".parse::<SenderType>().unwrap(), SenderType::Student);
        assert_eq!(" Teacher ".parse::<ReceiverType>().unwrap(), ReceiverType::Teacher);
        assert_eq!("urgent".parse::<Priority>().unwrap(), Priority::Urgent);
        let err = "parent".parse::<ReceiverType>().unwrap_err();
        assert_eq!(err.kind, "receiver type");
    }

    #[test]
    fn test_broker_priority_scale() {
        assert_eq!(Priority::Low.broker_priority(), 1);
        assert_eq!(Priority::Medium.broker_priority(), 4);
        assert_eq!(Priority::Urgent.broker_priority(), 9);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let envelope = sample().with_expiry(now + Duration::hours(1));
        assert!(!envelope.is_expired(now));
        assert!(envelope.is_expired(now + Duration::hours(2)));
        assert!(!sample().is_expired(now));
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let json = r#"{
            "senderId": 1, "senderType": "ADMIN",
            "receiverId": 0, "receiverType": "ALL",
            "subject": "Closure", "content": "School closed",
            "messageType": "BROADCAST",
            "createdAt": "2024-01-01T08:00:00Z"
        }"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.priority, Priority::Medium);
        assert_eq!(envelope.receiver_type, ReceiverType::All);
        assert!(envelope.expires_at.is_none());
    }

    #[test]
    fn test_related_entity() {
        let envelope = sample().with_related_entity(RelatedEntityType::Exam, 9);
        assert_eq!(
            envelope.related_entity,
            Some(RelatedEntity {
                entity_type: RelatedEntityType::Exam,
                id: 9
            })
        );
    }
}
