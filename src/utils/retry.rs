//! Retry utilities: backoff builders for broker connection attempts.
//!
//! Uses `backon` for exponential backoff with optional jitter.

use backon::ExponentialBuilder;

use crate::config::ReconnectConfig;

/// Backoff for broker connection attempts made by `initialize()`.
///
/// `max_attempts` counts retries after the first attempt, so the default of
/// zero yields an empty schedule.
pub fn connection_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay())
        .with_max_times(config.max_attempts);

    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::time::Duration;

    #[test]
    fn test_default_policy_never_retries() {
        let mut backoff = connection_backoff(&ReconnectConfig::default()).build();
        assert!(backoff.next().is_none());
    }

    #[test]
    fn test_schedule_respects_bounds() {
        let config = ReconnectConfig {
            max_attempts: 4,
            min_delay_ms: 10,
            max_delay_ms: 40,
            jitter: false,
        };
        let delays: Vec<Duration> = connection_backoff(&config).build().collect();

        assert_eq!(delays.len(), 4);
        assert_eq!(delays[0], Duration::from_millis(10));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
    }
}
