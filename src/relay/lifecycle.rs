//! Connection lifecycle: one shared broker connection and session.
//!
//! ```text
//! Disconnected ──initialize──▶ Connecting ──ok──▶ Ready
//!                                  │                │
//!                                 err            shutdown
//!                                  ▼                ▼
//!                               Failed ──▶ ... ShuttingDown ──▶ Closed
//! ```
//!
//! `Failed` may be retried with another `initialize()`. `Closed` is terminal.

use std::fmt;
use std::sync::{Arc, RwLock};

use backon::BackoffBuilder;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use super::events::{EventPublisher, RelayEvent};
use super::producer::ProducerCache;
use super::registry::ConsumerRegistry;
use crate::config::{BrokerConfig, ReconnectConfig};
use crate::error::{RelayError, Result};
use crate::transport::{self, BrokerConnection, BrokerSession, BrokerTransport};
use crate::utils::retry::connection_backoff;

/// Lifecycle state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
    ShuttingDown,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
        }
    }

    /// Shutdown has begun or finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::ShuttingDown | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LiveConnection {
    connection: Box<dyn BrokerConnection>,
    session: Arc<dyn BrokerSession>,
}

/// Owns the shared broker connection and session.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    broker: BrokerConfig,
    reconnect: ReconnectConfig,
    state: RwLock<ConnectionState>,
    /// Cheap-to-clone session handle read on every send and subscribe.
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    /// Serializes initialize and shutdown.
    live: Mutex<Option<LiveConnection>>,
    /// Flips to true once shutdown begins; wakes a connect loop in backoff.
    stopping: watch::Sender<bool>,
    events: EventPublisher,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        broker: BrokerConfig,
        reconnect: ReconnectConfig,
        events: EventPublisher,
    ) -> Self {
        Self {
            transport,
            broker,
            reconnect,
            state: RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            live: Mutex::new(None),
            stopping: watch::Sender::new(false),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// The shared session, or the fail-fast lifecycle error.
    pub fn session(&self) -> Result<Arc<dyn BrokerSession>> {
        match self.state() {
            ConnectionState::Ready => self
                .session
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or(RelayError::NotInitialized),
            ConnectionState::ShuttingDown | ConnectionState::Closed => {
                Err(RelayError::ShutdownInProgress)
            }
            _ => Err(RelayError::NotInitialized),
        }
    }

    /// Fail fast once shutdown has begun.
    pub fn ensure_running(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Err(RelayError::ShutdownInProgress);
        }
        Ok(())
    }

    /// Establish the shared connection and session.
    ///
    /// Idempotent once ready. On failure the manager is left `Failed` with no
    /// connection held, and may be initialized again.
    pub async fn initialize(&self) -> Result<()> {
        let mut live = self.live.lock().await;

        match self.state() {
            ConnectionState::Ready => return Ok(()),
            state if state.is_terminal() => return Err(RelayError::ShutdownInProgress),
            _ => {}
        }
        self.transition(ConnectionState::Connecting);

        match self.connect_with_backoff().await {
            Ok(established) => {
                // Shutdown may have begun while we were connecting
                if !self.transition_from(ConnectionState::Connecting, ConnectionState::Ready) {
                    Self::close_quietly(&established).await;
                    return Err(RelayError::ShutdownInProgress);
                }
                *self.session.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(Arc::clone(&established.session));
                *live = Some(established);
                info!(url = %self.broker.url, "Relay connected to broker");
                Ok(())
            }
            Err(RelayError::ShutdownInProgress) => {
                info!(url = %self.broker.url, "Connect abandoned, shutdown began");
                Err(RelayError::ShutdownInProgress)
            }
            Err(e) => {
                error!(url = %self.broker.url, error = ?e, "Relay failed to connect to broker");
                self.transition_from(ConnectionState::Connecting, ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Close producers, then consumers, then the session, then the connection.
    ///
    /// Idempotent. Close failures are logged and do not stop the sequence.
    pub async fn shutdown(&self, producers: &ProducerCache, consumers: &ConsumerRegistry) {
        if !self.begin_shutdown() {
            return;
        }

        producers.close_all().await;
        consumers.close_all().await;

        let mut live = self.live.lock().await;
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(established) = live.take() {
            Self::close_quietly(&established).await;
        }

        self.transition(ConnectionState::Closed);
        info!("Relay shut down");
    }

    /// Move to `ShuttingDown`. False if shutdown already began.
    fn begin_shutdown(&self) -> bool {
        let from = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.is_terminal() {
                return false;
            }
            std::mem::replace(&mut *state, ConnectionState::ShuttingDown)
        };
        self.stopping.send_replace(true);
        self.announce(from, ConnectionState::ShuttingDown);
        true
    }

    /// Connect, retrying per the reconnect policy. Gives up with
    /// `ShutdownInProgress` as soon as shutdown begins, including mid-backoff.
    async fn connect_with_backoff(&self) -> Result<LiveConnection> {
        let mut delays = connection_backoff(&self.reconnect).build();
        let mut stopping = self.stopping.subscribe();
        let mut attempt = 1;

        loop {
            if self.state().is_terminal() {
                return Err(RelayError::ShutdownInProgress);
            }
            let e = match self.connect_once().await {
                Ok(established) => return Ok(established),
                Err(e) => e,
            };
            let Some(delay) = delays.next() else {
                return Err(RelayError::Connection(e));
            };
            if self.state().is_terminal() {
                return Err(RelayError::ShutdownInProgress);
            }

            warn!(
                attempt,
                error = %e,
                backoff_ms = %delay.as_millis(),
                "Broker connection failed, retrying after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_signalled(&mut stopping) => {
                    return Err(RelayError::ShutdownInProgress);
                }
            }
            attempt += 1;
        }
    }

    async fn connect_once(&self) -> transport::Result<LiveConnection> {
        let connection = self.transport.connect(&self.broker).await?;
        match connection.open_session().await {
            Ok(session) => Ok(LiveConnection {
                connection,
                session,
            }),
            Err(e) => {
                // Never keep a half-open connection around
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection after session error");
                }
                Err(e)
            }
        }
    }

    async fn close_quietly(established: &LiveConnection) {
        if let Err(e) = established.session.close().await {
            warn!(error = %e, "Failed to close broker session");
        }
        if let Err(e) = established.connection.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
    }

    fn transition(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, to)
        };
        self.announce(from, to);
    }

    /// Compare-and-set transition. False if the state was not `expected`.
    fn transition_from(&self, expected: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if *state != expected {
                return false;
            }
            *state = to;
        }
        self.announce(expected, to);
        true
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        if from != to {
            info!(from = %from, to = %to, "Relay state changed");
            self.events.publish(RelayEvent::StateChanged { from, to });
        }
    }
}

/// Resolves once the stopping flag is set.
async fn shutdown_signalled(stopping: &mut watch::Receiver<bool>) {
    loop {
        let stop = *stopping.borrow_and_update();
        if stop {
            return;
        }
        if stopping.changed().await.is_err() {
            // Manager dropped; nothing will ever signal
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn manager(transport: &MemoryTransport, reconnect: ReconnectConfig) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(transport.clone()),
            BrokerConfig::default(),
            reconnect,
            EventPublisher::new(16),
        )
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ReconnectConfig::default());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(manager.session(), Err(RelayError::NotInitialized)));

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();

        assert!(manager.is_ready());
        assert!(manager.session().is_ok());
        assert_eq!(transport.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_holds_nothing() {
        let transport = MemoryTransport::new();
        transport.set_fail_connect(true);
        let manager = manager(&transport, ReconnectConfig::default());

        let err = manager.initialize().await.unwrap_err();

        assert!(matches!(err, RelayError::Connection(_)));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(matches!(manager.session(), Err(RelayError::NotInitialized)));
        assert_eq!(transport.open_connections(), 0);

        transport.set_fail_connect(false);
        manager.initialize().await.unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_initialize_retries_per_policy() {
        let transport = MemoryTransport::new();
        transport.set_fail_connect(true);
        let manager = Arc::new(manager(
            &transport,
            ReconnectConfig {
                max_attempts: 50,
                min_delay_ms: 5,
                max_delay_ms: 10,
                jitter: false,
            },
        ));

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.initialize().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        transport.set_fail_connect(false);

        task.await.unwrap().unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let transport = MemoryTransport::new();
        let events = EventPublisher::new(16);
        let mut rx = events.subscribe();
        let manager = ConnectionManager::new(
            Arc::new(transport),
            BrokerConfig::default(),
            ReconnectConfig::default(),
            events,
        );

        manager.initialize().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(RelayEvent::StateChanged { to, .. }) = rx.try_recv() {
            seen.push(to);
        }
        assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Ready]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_connect_backoff() {
        let transport = MemoryTransport::new();
        transport.set_fail_connect(true);
        let manager = Arc::new(manager(
            &transport,
            ReconnectConfig {
                max_attempts: 20,
                min_delay_ms: 100,
                max_delay_ms: 100,
                jitter: false,
            },
        ));
        let events = EventPublisher::new(4);
        let dispatcher = Arc::new(crate::relay::dispatch::Dispatcher::new(
            Arc::new(crate::relay::dispatch::Inline),
            events.clone(),
        ));
        let producers = ProducerCache::new(Default::default(), events.clone());
        let consumers = ConsumerRegistry::new(dispatcher, events);

        let init = tokio::spawn({
            let manager = manager.clone();
            async move { manager.initialize().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        manager.shutdown(&producers, &consumers).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(500));

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), init)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::ShutdownInProgress)));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(transport.open_connections(), 0);
    }
}
