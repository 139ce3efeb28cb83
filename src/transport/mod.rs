//! Broker transport abstraction.
//!
//! The relay core is written against this narrow surface only:
//! connect → open session → create producer/consumer per destination →
//! send / receive. Implementations:
//! - `MemoryTransport`: in-process broker (standalone use, tests)
//! - `AmqpTransport`: RabbitMQ via AMQP 0-9-1 (feature `amqp`)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::Destination;
use crate::config::BrokerConfig;
use crate::model::Payload;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by a broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Closed")]
    Closed,
}

/// Value of a filterable message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Int(i) => write!(f, "{}", i),
            HeaderValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Headers consumers can filter on without decoding the payload.
pub type MessageHeaders = BTreeMap<String, HeaderValue>;

/// A message ready for the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Payload,
    pub headers: MessageHeaders,
    /// Durable delivery.
    pub persistent: bool,
    /// Broker-side expiry.
    pub ttl: Duration,
    /// 0-9 priority hint.
    pub priority: u8,
}

impl OutboundMessage {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

/// Entry point of a broker implementation.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establish a connection to the broker.
    async fn connect(&self, settings: &BrokerConfig) -> Result<Box<dyn BrokerConnection>>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open the session all producers and consumers are created from.
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>>;

    async fn close(&self) -> Result<()>;
}

/// Factory for producers and consumers. Declares the destination on the
/// broker as a side effect of creating either.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn BrokerProducer>>;

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn BrokerConsumer>>;

    async fn close(&self) -> Result<()>;
}

/// Send channel bound to one destination.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Receive channel bound to one destination.
///
/// Pull form of a message callback: the relay drives each consumer from its
/// own task. `None` means the stream ended and will yield nothing further.
#[async_trait]
pub trait BrokerConsumer: Send {
    async fn next_delivery(&mut self) -> Option<Result<Payload>>;

    async fn close(&mut self) -> Result<()>;
}
