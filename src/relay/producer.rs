//! Producer cache: at most one live producer per destination.
//!
//! The map's shard lock is held only while a slot is fetched or inserted.
//! Creating a producer and sending through it happen under the slot's own
//! lock, so sends to different destinations never wait on each other while
//! concurrent first sends to one destination still create a single producer.
//!
//! A failed send closes and evicts the producer. The slot is marked retired
//! before it leaves the map; a sender that was queued on a retired slot starts
//! over with a fresh one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::{EventPublisher, RelayEvent};
use crate::address::Destination;
use crate::config::DeliveryConfig;
use crate::error::{RelayError, Result};
use crate::model::{MessageType, Payload, Priority};
use crate::transport::{
    BrokerProducer, BrokerSession, HeaderValue, MessageHeaders, OutboundMessage, TransportError,
};

/// Header names attached to every outbound message.
pub mod headers {
    pub const MESSAGE_TYPE: &str = "MessageType";
    pub const SENDER_TYPE: &str = "SenderType";
    pub const SENDER_ID: &str = "SenderId";
    pub const RECEIVER_TYPE: &str = "ReceiverType";
    pub const RECEIVER_ID: &str = "ReceiverId";
    pub const SUBJECT: &str = "Subject";
    pub const BROADCAST_TARGET: &str = "BroadcastTarget";
    pub const IS_BROADCAST: &str = "IsBroadcast";
    pub const NOTIFICATION_TYPE: &str = "NotificationType";
}

/// Broker TTL used for payloads whose expiry already passed.
const EXPIRED_TTL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct SlotState {
    producer: Option<Box<dyn BrokerProducer>>,
    retired: bool,
}

#[derive(Default)]
struct ProducerSlot {
    state: Mutex<SlotState>,
}

/// Lazily created, cached producers keyed by destination.
pub struct ProducerCache {
    slots: DashMap<Destination, Arc<ProducerSlot>>,
    live: AtomicUsize,
    closed: AtomicBool,
    delivery: DeliveryConfig,
    events: EventPublisher,
}

impl ProducerCache {
    pub fn new(delivery: DeliveryConfig, events: EventPublisher) -> Self {
        Self {
            slots: DashMap::new(),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            delivery,
            events,
        }
    }

    /// Send `payload` to `destination`, creating and caching its producer on
    /// first use.
    #[tracing::instrument(name = "relay.send", skip_all, fields(destination = %destination))]
    pub async fn send(
        &self,
        session: &Arc<dyn BrokerSession>,
        destination: &Destination,
        payload: Payload,
    ) -> Result<()> {
        let message = self.outbound(destination, payload);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RelayError::ShutdownInProgress);
            }
            let slot = self.slot(destination);
            let mut state = slot.state.lock().await;

            if self.closed.load(Ordering::SeqCst) {
                // An empty slot inserted after close_all began would never be
                // collected; occupied slots are left for close_all
                if state.producer.is_none() {
                    self.retire(destination, &slot, &mut state);
                }
                return Err(RelayError::ShutdownInProgress);
            }
            if state.retired {
                continue;
            }

            let producer = match state.producer.take() {
                Some(producer) => producer,
                None => match session.create_producer(destination).await {
                    Ok(producer) => {
                        self.live.fetch_add(1, Ordering::SeqCst);
                        info!(destination = %destination, "Producer created");
                        producer
                    }
                    Err(e) => {
                        self.retire(destination, &slot, &mut state);
                        return Err(RelayError::SendFailure {
                            destination: destination.name().to_string(),
                            source: e,
                        });
                    }
                },
            };

            return match self.send_with_timeout(producer.as_ref(), &message).await {
                Ok(()) => {
                    state.producer = Some(producer);
                    debug!(
                        destination = %destination,
                        subject = %message.payload.subject(),
                        "Payload sent"
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(destination = %destination, error = %e, "Send failed, evicting producer");
                    if let Err(close_err) = producer.close().await {
                        warn!(destination = %destination, error = %close_err, "Failed to close producer");
                    }
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    self.retire(destination, &slot, &mut state);
                    self.events.publish(RelayEvent::ProducerEvicted {
                        destination: destination.clone(),
                        reason: e.to_string(),
                    });
                    Err(RelayError::SendFailure {
                        destination: destination.name().to_string(),
                        source: e,
                    })
                }
            };
        }
    }

    /// Close every cached producer and refuse further sends.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<(Destination, Arc<ProducerSlot>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (destination, slot) in slots {
            let mut state = slot.state.lock().await;
            if let Some(producer) = state.producer.take() {
                if let Err(e) = producer.close().await {
                    warn!(destination = %destination, error = %e, "Failed to close producer");
                }
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
            self.retire(&destination, &slot, &mut state);
        }
    }

    /// Live producers.
    pub fn count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Destinations with a cache slot, sorted.
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        names.sort();
        names
    }

    fn slot(&self, destination: &Destination) -> Arc<ProducerSlot> {
        // Entry guard is dropped before the slot lock is awaited
        Arc::clone(&self.slots.entry(destination.clone()).or_default())
    }

    fn retire(&self, destination: &Destination, slot: &Arc<ProducerSlot>, state: &mut SlotState) {
        state.retired = true;
        self.slots
            .remove_if(destination, |_, current| Arc::ptr_eq(current, slot));
    }

    async fn send_with_timeout(
        &self,
        producer: &dyn BrokerProducer,
        message: &OutboundMessage,
    ) -> std::result::Result<(), TransportError> {
        match self.delivery.send_timeout() {
            Some(limit) => tokio::time::timeout(limit, producer.send(message))
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => producer.send(message).await,
        }
    }

    fn outbound(&self, destination: &Destination, payload: Payload) -> OutboundMessage {
        let (policy_ttl, expires_at) = match &payload {
            Payload::Notification(n) => (self.delivery.notification_ttl(), n.expires_at),
            Payload::Message(env) if destination.is_broadcast() => {
                (self.delivery.broadcast_ttl(), env.expires_at)
            }
            Payload::Message(env) => (self.delivery.point_to_point_ttl(), env.expires_at),
        };

        let ttl = match expires_at {
            Some(at) => match (at - Utc::now()).to_std() {
                Ok(remaining) => policy_ttl.min(remaining.max(EXPIRED_TTL)),
                Err(_) => EXPIRED_TTL,
            },
            None => policy_ttl,
        };

        let priority = match &payload {
            Payload::Message(env) => env.priority,
            Payload::Notification(_) => Priority::Medium,
        };

        OutboundMessage {
            headers: message_headers(destination, &payload),
            persistent: self.delivery.persistent,
            ttl,
            priority: priority.broker_priority(),
            payload,
        }
    }
}

/// Filterable headers derived from the payload.
pub fn message_headers(destination: &Destination, payload: &Payload) -> MessageHeaders {
    let mut h = MessageHeaders::new();
    match payload {
        Payload::Message(env) => {
            h.insert(headers::MESSAGE_TYPE.into(), env.message_type.as_str().into());
            h.insert(headers::SENDER_TYPE.into(), env.sender_type.as_str().into());
            h.insert(headers::SENDER_ID.into(), HeaderValue::Int(env.sender_id));
            h.insert(headers::RECEIVER_TYPE.into(), env.receiver_type.as_str().into());
            h.insert(headers::RECEIVER_ID.into(), HeaderValue::Int(env.receiver_id));
            h.insert(headers::SUBJECT.into(), env.subject.as_str().into());
            if destination.is_broadcast() {
                h.insert(headers::MESSAGE_TYPE.into(), MessageType::Broadcast.as_str().into());
                h.insert(headers::BROADCAST_TARGET.into(), env.receiver_type.as_str().into());
                h.insert(headers::IS_BROADCAST.into(), HeaderValue::Bool(true));
            }
        }
        Payload::Notification(n) => {
            h.insert(headers::MESSAGE_TYPE.into(), MessageType::Notification.as_str().into());
            h.insert(headers::NOTIFICATION_TYPE.into(), n.kind.as_str().into());
            h.insert(headers::RECEIVER_ID.into(), HeaderValue::Int(n.user_id));
            h.insert(headers::SUBJECT.into(), n.title.as_str().into());
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::model::{
        Envelope, Notification, NotificationKind, ReceiverType, SenderType,
    };
    use crate::transport::{BrokerTransport, MemoryTransport};

    fn envelope() -> Envelope {
        Envelope::new(
            (SenderType::Admin, 1),
            (ReceiverType::Student, 42),
            "Fees",
            "Due Monday",
            MessageType::Message,
        )
    }

    async fn setup() -> (ProducerCache, MemoryTransport, Arc<dyn BrokerSession>) {
        let transport = MemoryTransport::new();
        let connection = transport.connect(&BrokerConfig::default()).await.unwrap();
        let session = connection.open_session().await.unwrap();
        (
            ProducerCache::new(DeliveryConfig::default(), EventPublisher::new(16)),
            transport,
            session,
        )
    }

    #[tokio::test]
    async fn test_producer_created_once() {
        let (cache, transport, session) = setup().await;
        let dest = Destination::point_to_point("user.student.42");

        for _ in 0..5 {
            cache.send(&session, &dest, envelope().into()).await.unwrap();
        }

        assert_eq!(transport.producers_created(&dest), 1);
        assert_eq!(cache.count(), 1);
        assert_eq!(transport.sent_to(&dest).len(), 5);
    }

    #[tokio::test]
    async fn test_failed_send_evicts() {
        let (cache, transport, session) = setup().await;
        let dest = Destination::point_to_point("user.student.42");
        cache.send(&session, &dest, envelope().into()).await.unwrap();

        transport.fail_sends_to("user.student.42");
        let err = cache.send(&session, &dest, envelope().into()).await.unwrap_err();
        assert!(matches!(err, RelayError::SendFailure { .. }));
        assert_eq!(cache.count(), 0);
        assert!(cache.destinations().is_empty());
        assert_eq!(transport.live_producers(), 0);

        transport.clear_send_failures();
        cache.send(&session, &dest, envelope().into()).await.unwrap();
        assert_eq!(transport.producers_created(&dest), 2);
        assert_eq!(cache.count(), 1);
    }

    #[tokio::test]
    async fn test_send_timeout_evicts() {
        let transport = MemoryTransport::new();
        let connection = transport.connect(&BrokerConfig::default()).await.unwrap();
        let session = connection.open_session().await.unwrap();
        let cache = ProducerCache::new(
            DeliveryConfig {
                send_timeout_ms: Some(10),
                ..Default::default()
            },
            EventPublisher::new(16),
        );
        let dest = Destination::point_to_point("user.teacher.3");
        transport.set_send_delay(Some(Duration::from_millis(200)));

        let err = cache.send(&session, &dest, envelope().into()).await.unwrap_err();

        match err {
            RelayError::SendFailure { source, .. } => {
                assert!(matches!(source, TransportError::Timeout(_)))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(cache.count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_refuses_further_sends() {
        let (cache, transport, session) = setup().await;
        let dest = Destination::broadcast("broadcast.student");
        cache.send(&session, &dest, envelope().into()).await.unwrap();

        cache.close_all().await;

        assert_eq!(cache.count(), 0);
        assert_eq!(transport.live_producers(), 0);
        assert!(matches!(
            cache.send(&session, &dest, envelope().into()).await,
            Err(RelayError::ShutdownInProgress)
        ));
    }

    #[test]
    fn test_broadcast_headers() {
        let dest = Destination::broadcast("broadcast.student");
        let h = message_headers(&dest, &Payload::Message(envelope()));

        assert_eq!(h[headers::MESSAGE_TYPE], HeaderValue::from("BROADCAST"));
        assert_eq!(h[headers::BROADCAST_TARGET], HeaderValue::from("STUDENT"));
        assert_eq!(h[headers::IS_BROADCAST], HeaderValue::Bool(true));
        assert_eq!(h[headers::SENDER_ID], HeaderValue::Int(1));
    }

    #[test]
    fn test_notification_headers() {
        let dest = Destination::point_to_point("notification.9");
        let n = Notification::new(9, "Grade posted", "Math: A", NotificationKind::Grade);
        let h = message_headers(&dest, &Payload::Notification(n));

        assert_eq!(h[headers::MESSAGE_TYPE], HeaderValue::from("NOTIFICATION"));
        assert_eq!(h[headers::NOTIFICATION_TYPE], HeaderValue::from("GRADE"));
        assert_eq!(h[headers::RECEIVER_ID], HeaderValue::Int(9));
        assert!(!h.contains_key(headers::IS_BROADCAST));
    }

    #[test]
    fn test_ttl_policy() {
        let cache = ProducerCache::new(DeliveryConfig::default(), EventPublisher::new(1));
        let p2p = Destination::point_to_point("user.student.42");
        let bcast = Destination::broadcast("broadcast.student");

        assert_eq!(
            cache.outbound(&p2p, envelope().into()).ttl,
            Duration::from_secs(7 * 24 * 60 * 60)
        );
        assert_eq!(
            cache.outbound(&bcast, envelope().into()).ttl,
            Duration::from_secs(24 * 60 * 60)
        );

        let soon = envelope().with_expiry(Utc::now() + chrono::Duration::minutes(5));
        assert!(cache.outbound(&p2p, soon.into()).ttl <= Duration::from_secs(300));

        let past = envelope().with_expiry(Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(cache.outbound(&p2p, past.into()).ttl, EXPIRED_TTL);
    }

    #[test]
    fn test_priority_mapping() {
        let cache = ProducerCache::new(DeliveryConfig::default(), EventPublisher::new(1));
        let dest = Destination::point_to_point("user.student.42");
        let urgent = envelope().with_priority(Priority::Urgent);
        assert_eq!(cache.outbound(&dest, urgent.into()).priority, 9);
        assert_eq!(cache.outbound(&dest, envelope().into()).priority, 4);
    }

    #[tokio::test]
    async fn test_send_after_close_leaves_no_slot() {
        let (cache, transport, session) = setup().await;
        let dest = Destination::point_to_point("user.student.1");

        cache.close_all().await;
        let err = cache.send(&session, &dest, envelope().into()).await.unwrap_err();

        assert!(matches!(err, RelayError::ShutdownInProgress));
        assert_eq!(cache.count(), 0);
        assert!(cache.destinations().is_empty());
        assert_eq!(transport.producers_created(&dest), 0);
    }

    #[tokio::test]
    async fn test_send_racing_close_leaves_no_slot() {
        let (cache, transport, session) = setup().await;
        let cache = Arc::new(cache);
        transport.set_send_delay(Some(Duration::from_millis(50)));
        let busy = Destination::point_to_point("user.student.1");
        let late = Destination::point_to_point("user.student.2");

        let first = tokio::spawn({
            let (cache, session, busy) = (cache.clone(), session.clone(), busy.clone());
            async move { cache.send(&session, &busy, envelope().into()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let closing = tokio::spawn({
            let cache = cache.clone();
            async move { cache.close_all().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = cache.send(&session, &late, envelope().into()).await;

        first.await.unwrap().unwrap();
        closing.await.unwrap();
        assert!(matches!(second, Err(RelayError::ShutdownInProgress)));
        assert_eq!(cache.count(), 0);
        assert!(cache.destinations().is_empty());
    }
}
