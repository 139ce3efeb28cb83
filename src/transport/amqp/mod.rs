//! AMQP (RabbitMQ) broker transport.
//!
//! Point-to-point destinations are durable queues published to through the
//! default exchange. Broadcast destinations are durable fanout exchanges; each
//! consumer binds its own exclusive, server-named queue so every subscriber
//! sees every message.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info};

use super::{
    BrokerConnection, BrokerConsumer, BrokerProducer, BrokerSession, BrokerTransport,
    HeaderValue, MessageHeaders, OutboundMessage, Result, TransportError,
};
use crate::address::{Destination, DestinationKind};
use crate::config::BrokerConfig;
use crate::model::Payload;

/// Content type of relayed payloads.
const CONTENT_TYPE: &str = "application/json";
/// Default exchange used for point-to-point queues.
const DEFAULT_EXCHANGE: &str = "";
const REPLY_SUCCESS: u16 = 200;

/// AMQP broker transport using lapin.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self, settings: &BrokerConfig) -> Result<Box<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(settings.connection_name.clone().into());

        let connection = Connection::connect(&settings.effective_url(), properties)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect: {}", e)))?;

        info!(
            url = %settings.url,
            connection = %settings.connection_name,
            "Connected to AMQP"
        );

        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Session(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Session(format!("Failed to enable confirms: {}", e)))?;

        Ok(Arc::new(AmqpSession { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "relay shutdown")
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpSession {
    channel: Channel,
}

impl AmqpSession {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Session(format!("Failed to declare queue: {}", e)))?;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Session(format!("Failed to declare exchange: {}", e)))
    }

    /// Declare the destination and return the queue to consume from.
    async fn bind_consumer_queue(&self, destination: &Destination) -> Result<String> {
        match destination.kind() {
            DestinationKind::PointToPoint => {
                self.declare_queue(destination.name()).await?;
                Ok(destination.name().to_string())
            }
            DestinationKind::Broadcast => {
                self.declare_exchange(destination.name()).await?;
                let queue = self
                    .channel
                    .queue_declare(
                        "",
                        QueueDeclareOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        TransportError::Consumer(format!("Failed to declare queue: {}", e))
                    })?;
                let queue_name = queue.name().as_str().to_string();

                self.channel
                    .queue_bind(
                        &queue_name,
                        destination.name(),
                        "",
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| TransportError::Consumer(format!("Failed to bind queue: {}", e)))?;

                info!(
                    queue = %queue_name,
                    exchange = %destination.name(),
                    "Bound queue to exchange"
                );
                Ok(queue_name)
            }
        }
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn BrokerProducer>> {
        let (exchange, routing_key) = match destination.kind() {
            DestinationKind::PointToPoint => {
                self.declare_queue(destination.name()).await?;
                (DEFAULT_EXCHANGE.to_string(), destination.name().to_string())
            }
            DestinationKind::Broadcast => {
                self.declare_exchange(destination.name()).await?;
                (destination.name().to_string(), String::new())
            }
        };

        Ok(Box::new(AmqpProducer {
            channel: self.channel.clone(),
            exchange,
            routing_key,
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn BrokerConsumer>> {
        let queue = self.bind_consumer_queue(destination).await?;
        let tag = format!("campus-relay-{}", uuid::Uuid::new_v4());

        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consumer(format!("Failed to start consumer: {}", e)))?;

        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            consumer,
            tag,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "relay shutdown")
            .await
            .map_err(|e| TransportError::Session(format!("Failed to close channel: {}", e)))
    }
}

/// Convert relay headers to an AMQP field table.
fn field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(s.clone().into()),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(key.clone().into(), value);
    }
    FieldTable::from(table)
}

/// AMQP properties for an outbound message.
fn properties(message: &OutboundMessage) -> BasicProperties {
    // Zero would mean "expire immediately"; keep at least one millisecond
    let expiration_ms = message.ttl.as_millis().max(1);
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(if message.persistent { 2 } else { 1 })
        .with_expiration(expiration_ms.to_string().into())
        .with_priority(message.priority)
        .with_headers(field_table(&message.headers))
}

struct AmqpProducer {
    channel: Channel,
    exchange: String,
    routing_key: String,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerProducer for AmqpProducer {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let payload = message
            .payload
            .to_bytes()
            .map_err(|e| TransportError::Publish(format!("Failed to encode payload: {}", e)))?;

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties(message),
            )
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| TransportError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(TransportError::Publish(
                "Broker negatively acknowledged publish".to_string(),
            ));
        }

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "Published payload"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Producers share the session channel; closing only retires this handle
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
    tag: String,
    closed: bool,
}

#[async_trait]
impl BrokerConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Payload>> {
        if self.closed {
            return None;
        }
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(TransportError::Consumer(e.to_string()))),
        };

        match Payload::from_bytes(&delivery.data) {
            Ok(payload) => {
                if let Err(e) = delivery.ack(Default::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
                Some(Ok(payload))
            }
            Err(e) => {
                // Don't requeue malformed messages
                let _ = delivery.reject(Default::default()).await;
                Some(Err(TransportError::Decode(e.to_string())))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::Consumer(format!("Failed to cancel consumer: {}", e)))
    }
}
