//! Consumer registry: one consumer and an ordered listener list per
//! destination.
//!
//! Locking mirrors the producer cache. Each destination has a slot whose
//! async lock guards consumer creation and teardown; the listener list sits
//! behind a short synchronous lock so delivery can snapshot it without
//! waiting on subscribers.
//!
//! Every consumer is drained by its own delivery task, which stops when the
//! destination's last listener is removed, on shutdown, or when the transport
//! stream ends. In the last case the destination's listeners are dropped and
//! handed back in [`RelayEvent::SubscriptionLost`] for re-subscription.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatch::{Dispatcher, Listener};
use super::events::{EventPublisher, RelayEvent};
use crate::address::Destination;
use crate::error::{RelayError, Result};
use crate::transport::{BrokerConsumer, BrokerSession, TransportError};

type ListenerList = Arc<RwLock<Vec<Listener>>>;

/// Counts a consumer as live until released, at most once.
#[derive(Clone)]
struct LiveToken {
    active: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

impl LiveToken {
    fn acquire(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            active: Arc::new(AtomicBool::new(true)),
            live: Arc::clone(live),
        }
    }

    fn release(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A running consumer and its delivery task.
struct ConsumerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    token: LiveToken,
}

impl ConsumerHandle {
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Default)]
struct SlotState {
    consumer: Option<ConsumerHandle>,
    retired: bool,
}

#[derive(Default)]
struct ConsumerSlot {
    state: Mutex<SlotState>,
    listeners: ListenerList,
}

impl ConsumerSlot {
    fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}

/// Destination → consumer and listeners.
pub struct ConsumerRegistry {
    slots: DashMap<Destination, Arc<ConsumerSlot>>,
    live: Arc<AtomicUsize>,
    closed: AtomicBool,
    dispatcher: Arc<Dispatcher>,
    events: EventPublisher,
}

impl ConsumerRegistry {
    pub fn new(dispatcher: Arc<Dispatcher>, events: EventPublisher) -> Self {
        Self {
            slots: DashMap::new(),
            live: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            dispatcher,
            events,
        }
    }

    /// Register `listener` for `destination`, creating the destination's
    /// consumer if it has none.
    ///
    /// Registering the same listener twice keeps both registrations; it is
    /// then invoked twice per delivery. If the consumer cannot be created
    /// the registry is left as it was.
    #[tracing::instrument(name = "relay.subscribe", skip_all, fields(destination = %destination))]
    pub async fn subscribe(
        &self,
        session: &Arc<dyn BrokerSession>,
        destination: &Destination,
        listener: Listener,
    ) -> Result<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RelayError::ShutdownInProgress);
            }
            let slot = self.slot(destination);
            let mut state = slot.state.lock().await;

            if self.closed.load(Ordering::SeqCst) {
                if state.consumer.is_none() && slot.listener_count() == 0 {
                    state.retired = true;
                    self.slots
                        .remove_if(destination, |_, current| Arc::ptr_eq(current, &slot));
                }
                return Err(RelayError::ShutdownInProgress);
            }
            if state.retired {
                continue;
            }

            let needs_consumer = state.consumer.as_ref().map_or(true, |c| c.is_finished());
            if needs_consumer {
                match session.create_consumer(destination).await {
                    Ok(consumer) => {
                        state.consumer = Some(self.start_delivery(
                            destination.clone(),
                            consumer,
                            Arc::clone(&slot),
                        ));
                        info!(destination = %destination, "Consumer created");
                    }
                    Err(e) => {
                        if slot.listener_count() == 0 {
                            // Drop the slot this call inserted
                            state.retired = true;
                            self.slots
                                .remove_if(destination, |_, current| Arc::ptr_eq(current, &slot));
                        }
                        return Err(RelayError::SubscribeFailure {
                            destination: destination.name().to_string(),
                            source: e,
                        });
                    }
                }
            }

            slot.listeners
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(listener);
            debug!(
                destination = %destination,
                listeners = slot.listener_count(),
                "Listener registered"
            );
            return Ok(());
        }
    }

    /// Remove one registration of `listener` from `destination`.
    ///
    /// Returns `false` if it was not registered. Removing the last listener
    /// stops the destination's consumer.
    #[tracing::instrument(name = "relay.unsubscribe", skip_all, fields(destination = %destination))]
    pub async fn unsubscribe(&self, destination: &Destination, listener: &Listener) -> Result<bool> {
        let Some(slot) = self.slots.get(destination).map(|s| Arc::clone(s.value())) else {
            return Ok(false);
        };
        let mut state = slot.state.lock().await;
        if state.retired {
            return Ok(false);
        }

        let remaining = {
            let mut listeners = slot.listeners.write().unwrap_or_else(|e| e.into_inner());
            match listeners.iter().position(|l| l.same_as(listener)) {
                Some(index) => {
                    listeners.remove(index);
                    listeners.len()
                }
                None => return Ok(false),
            }
        };
        debug!(destination = %destination, listeners = remaining, "Listener removed");

        if remaining == 0 {
            state.retired = true;
            self.slots
                .remove_if(destination, |_, current| Arc::ptr_eq(current, &slot));
            if let Some(consumer) = state.consumer.take() {
                // The delivery task closes the consumer; not awaited so a
                // listener may unsubscribe itself
                consumer.token.release();
                let _ = consumer.stop.send(());
                info!(destination = %destination, "Consumer stopped");
            }
        }
        Ok(true)
    }

    /// Stop every consumer, wait for its delivery task, and refuse further
    /// subscriptions.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<(Destination, Arc<ConsumerSlot>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (destination, slot) in slots {
            let mut state = slot.state.lock().await;
            state.retired = true;
            self.slots
                .remove_if(&destination, |_, current| Arc::ptr_eq(current, &slot));
            slot.listeners
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .clear();

            if let Some(consumer) = state.consumer.take() {
                consumer.token.release();
                let _ = consumer.stop.send(());
                if let Err(e) = consumer.task.await {
                    warn!(destination = %destination, error = %e, "Delivery task failed");
                }
            }
        }
    }

    /// Live consumers.
    pub fn count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total registrations across all destinations.
    pub fn listener_count(&self) -> usize {
        self.slots
            .iter()
            .map(|entry| entry.value().listener_count())
            .sum()
    }

    /// Registrations for one destination.
    pub fn listeners_for(&self, destination: &Destination) -> usize {
        self.slots
            .get(destination)
            .map(|slot| slot.listener_count())
            .unwrap_or(0)
    }

    /// Destinations with at least one listener, sorted.
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().listener_count() > 0)
            .map(|entry| entry.key().to_string())
            .collect();
        names.sort();
        names
    }

    fn slot(&self, destination: &Destination) -> Arc<ConsumerSlot> {
        Arc::clone(&self.slots.entry(destination.clone()).or_default())
    }

    fn start_delivery(
        &self,
        destination: Destination,
        mut consumer: Box<dyn BrokerConsumer>,
        slot: Arc<ConsumerSlot>,
    ) -> ConsumerHandle {
        let (stop, mut stopped) = oneshot::channel();
        let dispatcher = Arc::clone(&self.dispatcher);
        let events = self.events.clone();
        let token = LiveToken::acquire(&self.live);
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let mut stream_ended = false;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    delivery = consumer.next_delivery() => match delivery {
                        Some(Ok(payload)) => {
                            let snapshot: Vec<Listener> = slot
                                .listeners
                                .read()
                                .map(|l| l.to_vec())
                                .unwrap_or_default();
                            dispatcher
                                .dispatch(&destination, &snapshot, Arc::new(payload))
                                .await;
                        }
                        Some(Err(TransportError::Decode(e))) => {
                            warn!(destination = %destination, error = %e, "Skipping undecodable message");
                        }
                        Some(Err(e)) => {
                            warn!(destination = %destination, error = %e, "Consumer delivery error");
                        }
                        None => {
                            stream_ended = true;
                            break;
                        }
                    },
                }
            }

            if let Err(e) = consumer.close().await {
                warn!(destination = %destination, error = %e, "Failed to close consumer");
            }
            task_token.release();

            if stream_ended {
                // Unsubscribe and close_all signal `stopped` while holding the
                // slot lock, so they never wait on this branch
                tokio::select! {
                    biased;
                    _ = &mut stopped => {}
                    mut state = slot.state.lock() => {
                        state.consumer = None;
                        let dropped = std::mem::take(
                            &mut *slot.listeners.write().unwrap_or_else(|e| e.into_inner()),
                        );
                        warn!(
                            destination = %destination,
                            listeners = dropped.len(),
                            "Consumer stream ended, listeners dropped"
                        );
                        events.publish(RelayEvent::SubscriptionLost {
                            destination: destination.clone(),
                            listeners: dropped,
                        });
                    }
                }
            }
            events.publish(RelayEvent::DeliveryStopped { destination });
        });

        ConsumerHandle { stop, task, token }
    }
}
