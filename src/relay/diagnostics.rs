//! Read-only relay snapshot.

use serde::Serialize;

use super::lifecycle::ConnectionState;

/// Point-in-time view of the relay's live resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub producer_count: usize,
    pub consumer_count: usize,
    pub listener_count: usize,
    pub ready: bool,
    pub state: ConnectionState,
    /// Destinations with a cached producer, sorted by name.
    pub producer_destinations: Vec<String>,
    /// Destinations with at least one listener, sorted by name.
    pub consumer_destinations: Vec<String>,
}

impl Diagnostics {
    /// True when nothing is held open.
    pub fn is_idle(&self) -> bool {
        self.producer_count == 0 && self.consumer_count == 0 && self.listener_count == 0
    }
}
