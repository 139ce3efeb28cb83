//! Relay events for external subscribers.
//!
//! Presentation layers (pop-ups, badges, activity feeds) subscribe here
//! instead of being called from inside message handling.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::dispatch::{DispatchReport, Listener};
use super::lifecycle::ConnectionState;
use crate::address::Destination;
use crate::model::Payload;

/// Something observable happened inside the relay.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// The connection lifecycle moved between states.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// An inbound payload was fanned out to the destination's listeners.
    Delivered {
        destination: Destination,
        payload: Arc<Payload>,
        report: DispatchReport,
    },
    /// A listener returned an error or panicked during fan-out.
    ListenerFailed {
        destination: Destination,
        message: String,
    },
    /// A producer was closed and dropped from the cache after a send failure.
    ProducerEvicted {
        destination: Destination,
        reason: String,
    },
    /// The broker ended a destination's stream. Its listeners were
    /// unregistered and are returned here so they can be subscribed again.
    SubscriptionLost {
        destination: Destination,
        listeners: Vec<Listener>,
    },
    /// A destination's delivery path stopped (unsubscribe, shutdown or
    /// end of the transport stream).
    DeliveryStopped { destination: Destination },
}

/// Fan-out point for [`RelayEvent`]s. Publishing never blocks and never
/// fails; events are dropped when nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<RelayEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let events = EventPublisher::new(4);
        events.publish(RelayEvent::DeliveryStopped {
            destination: Destination::point_to_point("user.student.1"),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let events = EventPublisher::new(4);
        let mut rx = events.subscribe();
        events.publish(RelayEvent::ProducerEvicted {
            destination: Destination::point_to_point("user.student.1"),
            reason: "broker closed channel".to_string(),
        });

        match rx.recv().await.unwrap() {
            RelayEvent::ProducerEvicted { destination, .. } => {
                assert_eq!(destination.name(), "user.student.1")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
