//! In-process broker transport.
//!
//! Point-to-point destinations are queues that retain messages until a
//! consumer takes them; each message is consumed once. Broadcast destinations
//! are topics backed by tokio broadcast channels and reach every live
//! consumer. Payloads are encoded to bytes on send and decoded on receive,
//! exactly as they would be on a real broker.
//!
//! Cloning a `MemoryTransport` shares the broker, so a test can keep a handle
//! for inspection and fault injection while the relay owns another.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
#[cfg(any(test, feature = "test-utils"))]
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use super::{
    BrokerConnection, BrokerConsumer, BrokerProducer, BrokerSession, BrokerTransport,
    OutboundMessage, Result, TransportError,
};
use crate::address::{Destination, DestinationKind};
use crate::config::BrokerConfig;
use crate::model::Payload;

/// Topic channel capacity.
const TOPIC_CAPACITY: usize = 1024;

type Frame = Arc<Vec<u8>>;

/// Messages waiting on a point-to-point destination.
#[derive(Default)]
struct MemoryQueue {
    frames: Mutex<VecDeque<Frame>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push(&self, frame: Frame) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push_back(frame);
        }
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<Frame> {
        self.frames.lock().ok().and_then(|mut frames| frames.pop_front())
    }

    fn len(&self) -> usize {
        self.frames.lock().map(|frames| frames.len()).unwrap_or(0)
    }
}

/// Injected failures.
#[derive(Default)]
struct Faults {
    fail_connect: AtomicBool,
    fail_sends: Mutex<HashSet<String>>,
    fail_consumers: Mutex<HashSet<String>>,
    #[cfg(any(test, feature = "test-utils"))]
    send_delay: Mutex<Option<Duration>>,
}

impl Faults {
    fn contains(set: &Mutex<HashSet<String>>, name: &str) -> bool {
        set.lock().map(|set| set.contains(name)).unwrap_or(false)
    }
}

/// Shared broker state.
#[derive(Default)]
struct MemoryBroker {
    queues: DashMap<String, Arc<MemoryQueue>>,
    topics: DashMap<String, broadcast::Sender<Frame>>,
    producers_created: DashMap<Destination, usize>,
    consumers_created: DashMap<Destination, usize>,
    live_producers: AtomicUsize,
    live_consumers: AtomicUsize,
    connections: AtomicUsize,
    sent: Mutex<Vec<(Destination, OutboundMessage)>>,
    close_log: Mutex<Vec<String>>,
    faults: Faults,
}

impl MemoryBroker {
    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues.entry(name.to_string()).or_default().clone()
    }

    fn topic(&self, name: &str) -> broadcast::Sender<Frame> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn deliver(&self, destination: &Destination, frame: Frame) {
        match destination.kind() {
            DestinationKind::PointToPoint => self.queue(destination.name()).push(frame),
            DestinationKind::Broadcast => {
                // No receivers is fine: topics do not retain messages
                let _ = self.topic(destination.name()).send(frame);
            }
        }
    }

    fn log_close(&self, entry: String) {
        if let Ok(mut log) = self.close_log.lock() {
            log.push(entry);
        }
    }
}

/// In-process broker transport.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of producers ever created for `destination`.
    pub fn producers_created(&self, destination: &Destination) -> usize {
        self.broker
            .producers_created
            .get(destination)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Number of consumers ever created for `destination`.
    pub fn consumers_created(&self, destination: &Destination) -> usize {
        self.broker
            .consumers_created
            .get(destination)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Producers created and not yet closed.
    pub fn live_producers(&self) -> usize {
        self.broker.live_producers.load(Ordering::SeqCst)
    }

    /// Consumers created and not yet closed.
    pub fn live_consumers(&self) -> usize {
        self.broker.live_consumers.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.broker.connections.load(Ordering::SeqCst)
    }

    /// Messages waiting on a point-to-point destination.
    pub fn queued(&self, name: &str) -> usize {
        self.broker.queues.get(name).map(|q| q.len()).unwrap_or(0)
    }

    /// Every message accepted by a producer for `destination`, in send order.
    pub fn sent_to(&self, destination: &Destination) -> Vec<OutboundMessage> {
        self.broker
            .sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .filter(|(d, _)| d == destination)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close operations in the order they happened, e.g. `producer:user.student.1`.
    pub fn close_log(&self) -> Vec<String> {
        self.broker
            .close_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Deliver a payload as if another process had sent it.
    pub fn inject(&self, destination: &Destination, payload: &Payload) -> Result<()> {
        let bytes = payload
            .to_bytes()
            .map_err(|e| TransportError::Publish(format!("Failed to encode payload: {}", e)))?;
        self.broker.deliver(destination, Arc::new(bytes));
        Ok(())
    }

    /// Deliver raw bytes, bypassing encoding.
    pub fn inject_raw(&self, destination: &Destination, bytes: Vec<u8>) {
        self.broker.deliver(destination, Arc::new(bytes));
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryTransport {
    /// Make `connect` fail until cleared.
    pub fn set_fail_connect(&self, fail: bool) {
        self.broker.faults.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every send to the named destination fail until cleared.
    pub fn fail_sends_to(&self, name: &str) {
        if let Ok(mut set) = self.broker.faults.fail_sends.lock() {
            set.insert(name.to_string());
        }
    }

    pub fn clear_send_failures(&self) {
        if let Ok(mut set) = self.broker.faults.fail_sends.lock() {
            set.clear();
        }
    }

    /// Make consumer creation for the named destination fail until cleared.
    pub fn fail_consumers_for(&self, name: &str) {
        if let Ok(mut set) = self.broker.faults.fail_consumers.lock() {
            set.insert(name.to_string());
        }
    }

    pub fn clear_consumer_failures(&self) {
        if let Ok(mut set) = self.broker.faults.fail_consumers.lock() {
            set.clear();
        }
    }

    /// Drop a broadcast topic, ending the stream of every consumer on it.
    pub fn close_topic(&self, name: &str) {
        self.broker.topics.remove(name);
    }

    /// Delay every send, to exercise send timeouts and lock contention.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.broker.faults.send_delay.lock() {
            *slot = delay;
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&self, settings: &BrokerConfig) -> Result<Box<dyn BrokerConnection>> {
        if self.broker.faults.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!(
                "Broker unreachable at {}",
                settings.url
            )));
        }
        self.broker.connections.fetch_add(1, Ordering::SeqCst);
        info!(connection = %settings.connection_name, "In-memory broker connected");
        Ok(Box::new(MemoryConnection {
            broker: self.broker.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(Arc::new(MemorySession {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            connection_closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.connections.fetch_sub(1, Ordering::SeqCst);
            self.broker.log_close("connection".to_string());
        }
        Ok(())
    }
}

struct MemorySession {
    broker: Arc<MemoryBroker>,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn BrokerProducer>> {
        self.ensure_open()?;
        *self
            .broker
            .producers_created
            .entry(destination.clone())
            .or_insert(0) += 1;
        self.broker.live_producers.fetch_add(1, Ordering::SeqCst);
        debug!(destination = %destination, "In-memory producer created");
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            destination: destination.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn BrokerConsumer>> {
        self.ensure_open()?;
        if Faults::contains(&self.broker.faults.fail_consumers, destination.name()) {
            return Err(TransportError::Consumer(format!(
                "Injected consumer failure for {}",
                destination
            )));
        }
        let source = match destination.kind() {
            DestinationKind::PointToPoint => {
                ConsumerSource::Queue(self.broker.queue(destination.name()))
            }
            DestinationKind::Broadcast => {
                ConsumerSource::Topic(self.broker.topic(destination.name()).subscribe())
            }
        };
        *self
            .broker
            .consumers_created
            .entry(destination.clone())
            .or_insert(0) += 1;
        self.broker.live_consumers.fetch_add(1, Ordering::SeqCst);
        debug!(destination = %destination, "In-memory consumer created");
        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            destination: destination.clone(),
            source,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.log_close("session".to_string());
        }
        Ok(())
    }
}

struct MemoryProducer {
    broker: Arc<MemoryBroker>,
    destination: Destination,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        #[cfg(any(test, feature = "test-utils"))]
        {
            let delay = self
                .broker
                .faults
                .send_delay
                .lock()
                .ok()
                .and_then(|slot| *slot);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        if Faults::contains(&self.broker.faults.fail_sends, self.destination.name()) {
            return Err(TransportError::Publish(format!(
                "Injected send failure for {}",
                self.destination
            )));
        }

        let bytes = message
            .payload
            .to_bytes()
            .map_err(|e| TransportError::Publish(format!("Failed to encode payload: {}", e)))?;
        self.broker.deliver(&self.destination, Arc::new(bytes));

        if let Ok(mut sent) = self.broker.sent.lock() {
            sent.push((self.destination.clone(), message.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.live_producers.fetch_sub(1, Ordering::SeqCst);
            self.broker
                .log_close(format!("producer:{}", self.destination.name()));
        }
        Ok(())
    }
}

enum ConsumerSource {
    Queue(Arc<MemoryQueue>),
    Topic(broadcast::Receiver<Frame>),
}

struct MemoryConsumer {
    broker: Arc<MemoryBroker>,
    destination: Destination,
    source: ConsumerSource,
    closed: bool,
}

impl MemoryConsumer {
    fn decode(frame: &[u8]) -> Result<Payload> {
        Payload::from_bytes(frame).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Payload>> {
        if self.closed {
            return None;
        }
        match &mut self.source {
            ConsumerSource::Queue(queue) => loop {
                // Register interest before checking so a concurrent push is not missed
                let notified = queue.notify.notified();
                if let Some(frame) = queue.pop() {
                    return Some(Self::decode(&frame));
                }
                notified.await;
            },
            ConsumerSource::Topic(receiver) => loop {
                match receiver.recv().await {
                    Ok(frame) => return Some(Self::decode(&frame)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            destination = %self.destination,
                            skipped = n,
                            "Topic consumer lagged, skipped messages"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.broker.live_consumers.fetch_sub(1, Ordering::SeqCst);
            self.broker
                .log_close(format!("consumer:{}", self.destination.name()));
        }
        Ok(())
    }
}
