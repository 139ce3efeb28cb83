//! Broker connection and reconnect configuration.

use std::time::Duration;

use serde::Deserialize;

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL.
    pub url: String,
    /// Username (optional, overrides credentials embedded in the URL).
    pub username: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
    /// Connection name reported to the broker.
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            username: None,
            password: None,
            connection_name: "campus-relay".to_string(),
        }
    }
}

impl BrokerConfig {
    /// URL with configured credentials spliced in, when both are set.
    pub fn effective_url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => match self.url.split_once("://") {
                Some((scheme, rest)) => {
                    let host = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
                    format!("{}://{}:{}@{}", scheme, user, pass, host)
                }
                None => self.url.clone(),
            },
            _ => self.url.clone(),
        }
    }
}

/// Backoff applied when establishing the broker connection.
///
/// `max_attempts = 0` keeps the baseline behaviour: one attempt, no implicit
/// retry. The service stays not-ready until `initialize()` is called again.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retries after the first failed attempt.
    pub max_attempts: usize,
    /// Delay before the first retry, in milliseconds.
    pub min_delay_ms: u64,
    /// Delay cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize delays.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
