//! Relay core: the service facade and its components.
//!
//! [`RelayService`] is the single entry point an application holds. It owns
//! the connection lifecycle, the producer cache, the consumer registry and
//! the dispatcher, all sharing one broker session.
//!
//! ```ignore
//! let relay = RelayService::in_memory(RelayConfig::default());
//! relay.initialize().await?;
//!
//! let inbox = listener_fn(|payload| {
//!     println!("new message: {}", payload.subject());
//!     Ok(())
//! });
//! relay.subscribe_user("student", 42, inbox.clone()).await?;
//! relay.send_user_message("student", 42, envelope).await?;
//! ```

pub mod diagnostics;
pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod producer;
pub mod registry;

pub use diagnostics::Diagnostics;
pub use dispatch::{
    listener_async, listener_fn, DispatchContext, DispatchReport, Dispatcher, Inline, Listener,
    ListenerError, MessageListener,
};
pub use events::{EventPublisher, RelayEvent};
pub use lifecycle::{ConnectionManager, ConnectionState};
pub use producer::{message_headers, ProducerCache};
pub use registry::ConsumerRegistry;

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::address::{AddressResolver, Destination};
use crate::config::RelayConfig;
use crate::error::Result;
use crate::model::{Envelope, Notification, Payload};
use crate::transport::{BrokerTransport, MemoryTransport};

struct RelayInner {
    resolver: AddressResolver,
    lifecycle: ConnectionManager,
    producers: ProducerCache,
    consumers: ConsumerRegistry,
    events: EventPublisher,
}

/// Message relay service handle. Clones share the same relay.
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<RelayInner>,
}

impl RelayService {
    /// Create a relay over `transport` with inline dispatch.
    pub fn new(config: RelayConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        Self::with_dispatch_context(config, transport, Arc::new(Inline))
    }

    /// Create a relay whose fan-outs run inside `context`.
    pub fn with_dispatch_context(
        config: RelayConfig,
        transport: Arc<dyn BrokerTransport>,
        context: Arc<dyn DispatchContext>,
    ) -> Self {
        let events = EventPublisher::new(config.dispatch.event_capacity);
        let dispatcher = Arc::new(Dispatcher::new(context, events.clone()));

        Self {
            inner: Arc::new(RelayInner {
                resolver: AddressResolver::new(config.naming.scheme),
                lifecycle: ConnectionManager::new(
                    transport,
                    config.broker,
                    config.reconnect,
                    events.clone(),
                ),
                producers: ProducerCache::new(config.delivery, events.clone()),
                consumers: ConsumerRegistry::new(dispatcher, events.clone()),
                events,
            }),
        }
    }

    /// Create a relay over a private in-process broker.
    pub fn in_memory(config: RelayConfig) -> Self {
        Self::new(config, Arc::new(MemoryTransport::new()))
    }

    /// Connect to the broker. Idempotent once ready.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.lifecycle.initialize().await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lifecycle.is_ready()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// Stop accepting work, then close producers, consumers, session and
    /// connection in that order. Terminal and idempotent.
    ///
    /// Must not be awaited from inside a listener.
    pub async fn shutdown(&self) {
        self.inner
            .lifecycle
            .shutdown(&self.inner.producers, &self.inner.consumers)
            .await;
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.inner.resolver
    }

    /// Subscribe to relay events.
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Send a payload to an already-resolved destination.
    pub async fn send(&self, destination: &Destination, payload: impl Into<Payload>) -> Result<()> {
        let session = self.inner.lifecycle.session()?;
        self.inner
            .producers
            .send(&session, destination, payload.into())
            .await
    }

    /// Send `envelope` to one participant.
    pub async fn send_user_message(
        &self,
        recipient_type: &str,
        recipient_id: impl fmt::Display,
        envelope: Envelope,
    ) -> Result<()> {
        let destination = self
            .inner
            .resolver
            .resolve_point_to_point(recipient_type, recipient_id)?;
        self.send(&destination, envelope).await
    }

    /// Send `envelope` to every participant of `recipient_type`.
    pub async fn broadcast(&self, recipient_type: &str, envelope: Envelope) -> Result<()> {
        let destination = self.inner.resolver.resolve_broadcast(recipient_type)?;
        self.send(&destination, envelope).await
    }

    /// Send a notification to one user's notification destination.
    pub async fn send_notification(
        &self,
        user_id: impl fmt::Display,
        notification: Notification,
    ) -> Result<()> {
        let destination = self.inner.resolver.resolve_notification(user_id)?;
        self.send(&destination, notification).await
    }

    /// Register `listener` on `destination`.
    pub async fn subscribe(&self, destination: &Destination, listener: Listener) -> Result<()> {
        let session = self.inner.lifecycle.session()?;
        self.inner
            .consumers
            .subscribe(&session, destination, listener)
            .await
    }

    /// Remove one registration of `listener` from `destination`.
    pub async fn unsubscribe(&self, destination: &Destination, listener: &Listener) -> Result<bool> {
        self.inner.lifecycle.ensure_running()?;
        self.inner.consumers.unsubscribe(destination, listener).await
    }

    pub async fn subscribe_user(
        &self,
        recipient_type: &str,
        recipient_id: impl fmt::Display,
        listener: Listener,
    ) -> Result<Destination> {
        let destination = self
            .inner
            .resolver
            .resolve_point_to_point(recipient_type, recipient_id)?;
        self.subscribe(&destination, listener).await?;
        Ok(destination)
    }

    pub async fn subscribe_broadcast(
        &self,
        recipient_type: &str,
        listener: Listener,
    ) -> Result<Destination> {
        let destination = self.inner.resolver.resolve_broadcast(recipient_type)?;
        self.subscribe(&destination, listener).await?;
        Ok(destination)
    }

    pub async fn subscribe_notifications(
        &self,
        user_id: impl fmt::Display,
        listener: Listener,
    ) -> Result<Destination> {
        let destination = self.inner.resolver.resolve_notification(user_id)?;
        self.subscribe(&destination, listener).await?;
        Ok(destination)
    }

    pub async fn unsubscribe_user(
        &self,
        recipient_type: &str,
        recipient_id: impl fmt::Display,
        listener: &Listener,
    ) -> Result<bool> {
        let destination = self
            .inner
            .resolver
            .resolve_point_to_point(recipient_type, recipient_id)?;
        self.unsubscribe(&destination, listener).await
    }

    pub async fn unsubscribe_broadcast(
        &self,
        recipient_type: &str,
        listener: &Listener,
    ) -> Result<bool> {
        let destination = self.inner.resolver.resolve_broadcast(recipient_type)?;
        self.unsubscribe(&destination, listener).await
    }

    pub async fn unsubscribe_notifications(
        &self,
        user_id: impl fmt::Display,
        listener: &Listener,
    ) -> Result<bool> {
        let destination = self.inner.resolver.resolve_notification(user_id)?;
        self.unsubscribe(&destination, listener).await
    }

    /// Snapshot of live resources. Never mutates state.
    pub fn diagnostics(&self) -> Diagnostics {
        let inner = &self.inner;
        let state = inner.lifecycle.state();
        Diagnostics {
            producer_count: inner.producers.count(),
            consumer_count: inner.consumers.count(),
            listener_count: inner.consumers.listener_count(),
            ready: state == ConnectionState::Ready,
            state,
            producer_destinations: inner.producers.destinations(),
            consumer_destinations: inner.consumers.destinations(),
        }
    }

    /// Log the diagnostics snapshot.
    pub fn log_diagnostics(&self) {
        let diagnostics = self.diagnostics();
        match serde_json::to_string(&diagnostics) {
            Ok(json) => info!(diagnostics = %json, "Relay diagnostics"),
            Err(_) => info!(?diagnostics, "Relay diagnostics"),
        }
    }
}

impl fmt::Debug for RelayService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayService")
            .field("scheme", &self.inner.resolver.scheme())
            .field("state", &self.state())
            .finish()
    }
}
