//! Delivery policy: persistence, time-to-live and send timeout.

use std::time::Duration;

use serde::Deserialize;

/// Point-to-point user message TTL: 7 days.
pub const DEFAULT_POINT_TO_POINT_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Broadcast TTL: 24 hours.
pub const DEFAULT_BROADCAST_TTL_SECS: u64 = 24 * 60 * 60;
/// Notification TTL: 7 days.
pub const DEFAULT_NOTIFICATION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Default relay event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Outbound delivery policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Persistent (durable) delivery. Retained-message semantics depend on it.
    pub persistent: bool,
    pub point_to_point_ttl_secs: u64,
    pub broadcast_ttl_secs: u64,
    pub notification_ttl_secs: u64,
    /// Per-send timeout. `None` waits on the transport indefinitely.
    pub send_timeout_ms: Option<u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            point_to_point_ttl_secs: DEFAULT_POINT_TO_POINT_TTL_SECS,
            broadcast_ttl_secs: DEFAULT_BROADCAST_TTL_SECS,
            notification_ttl_secs: DEFAULT_NOTIFICATION_TTL_SECS,
            send_timeout_ms: None,
        }
    }
}

impl DeliveryConfig {
    pub fn point_to_point_ttl(&self) -> Duration {
        Duration::from_secs(self.point_to_point_ttl_secs)
    }

    pub fn broadcast_ttl(&self) -> Duration {
        Duration::from_secs(self.broadcast_ttl_secs)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_secs(self.notification_ttl_secs)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}

/// Fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of the relay event channel. Slow event subscribers lag and
    /// lose the oldest events; delivery to listeners is unaffected.
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
