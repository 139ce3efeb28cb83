//! Destination naming.
//!
//! Maps a logical recipient to the physical queue/topic name used on the
//! broker. Pure and deterministic: the same recipient always yields the same
//! name, and the destination kind is part of the key so point-to-point and
//! broadcast names never collide in the caches.
//!
//! Two naming schemes are deployed and must be reproduced exactly:
//!
//! | Scheme        | Point-to-point           | Broadcast               | Notification        |
//! |---------------|--------------------------|-------------------------|---------------------|
//! | `Originating` | `user.<type-lower>.<id>` | `broadcast.<type-lower>`| -                   |
//! | `Relay`       | `USER.<TYPE-UPPER>.<id>` | `BROADCAST.<TYPE-UPPER>`| `NOTIFICATION.<id>` |

use std::fmt;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Destination naming scheme, chosen per deployment role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingScheme {
    /// Lowercase dotted names used by the sending applications.
    #[default]
    Originating,
    /// Uppercase dotted names used by the server-side relay, including the
    /// per-user notification namespace.
    Relay,
}

/// Delivery semantics of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    /// Queue: each message is consumed once.
    PointToPoint,
    /// Topic: each message reaches every subscriber.
    Broadcast,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::PointToPoint => "point-to-point",
            DestinationKind::Broadcast => "broadcast",
        }
    }
}

/// A resolved physical destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn point_to_point(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::PointToPoint, name)
    }

    pub fn broadcast(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Broadcast, name)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind == DestinationKind::Broadcast
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolves logical recipients to destinations under one naming scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressResolver {
    scheme: NamingScheme,
}

impl AddressResolver {
    pub fn new(scheme: NamingScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> NamingScheme {
        self.scheme
    }

    /// Destination for messages addressed to one participant.
    pub fn resolve_point_to_point(
        &self,
        recipient_type: &str,
        recipient_id: impl fmt::Display,
    ) -> Result<Destination> {
        let recipient_type = Self::validate(recipient_type)?;
        let name = match self.scheme {
            NamingScheme::Originating => {
                format!("user.{}.{}", recipient_type.to_lowercase(), recipient_id)
            }
            NamingScheme::Relay => {
                format!("USER.{}.{}", recipient_type.to_uppercase(), recipient_id)
            }
        };
        Ok(Destination::point_to_point(name))
    }

    /// Destination for announcements to every participant of a type.
    pub fn resolve_broadcast(&self, recipient_type: &str) -> Result<Destination> {
        let recipient_type = Self::validate(recipient_type)?;
        let name = match self.scheme {
            NamingScheme::Originating => format!("broadcast.{}", recipient_type.to_lowercase()),
            NamingScheme::Relay => format!("BROADCAST.{}", recipient_type.to_uppercase()),
        };
        Ok(Destination::broadcast(name))
    }

    /// Destination for per-user notifications. Only the relay scheme has one.
    pub fn resolve_notification(&self, user_id: impl fmt::Display) -> Result<Destination> {
        match self.scheme {
            NamingScheme::Relay => Ok(Destination::point_to_point(format!(
                "NOTIFICATION.{}",
                user_id
            ))),
            NamingScheme::Originating => Err(RelayError::DestinationResolution(
                "notification namespace not available in the originating naming scheme"
                    .to_string(),
            )),
        }
    }

    fn validate(recipient_type: &str) -> Result<&str> {
        let trimmed = recipient_type.trim();
        if trimmed.is_empty() {
            return Err(RelayError::DestinationResolution(
                "recipient type is empty".to_string(),
            ));
        }
        Ok(trimmed)
    }
}
