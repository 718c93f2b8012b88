//! Feed configuration and relay status.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Tuning for [`ChangeFeed`](crate::ChangeFeed).
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Capacity of each subscription's queue.
    pub queue_capacity: usize,

    /// How long dispatch waits for room in a full queue before detaching
    /// that subscription.
    pub send_timeout: Duration,

    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_base_delay: Duration,

    /// Upper bound on the reconnect delay (before jitter).
    pub reconnect_max_delay: Duration,

    /// Consecutive failures after which attached subscriptions are told the
    /// relay is unavailable. 0 disables the report.
    pub max_retries: u32,

    /// Random extra delay (0..jitter) added to every reconnect wait.
    pub jitter: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            send_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_retries: 5,
            jitter: Duration::from_millis(250),
        }
    }
}

impl FeedConfig {
    /// Delay before the next connection attempt after `failures`
    /// consecutive failures, without jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }

    pub(crate) fn backoff_with_jitter(&self, failures: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        self.backoff(failures) + jitter
    }
}

/// Health of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    /// Not connected yet, or reconnecting after a dropped stream.
    Connecting,
    /// The stream is open.
    Connected,
    /// The retry budget ran out; still retrying in the background.
    Unavailable,
    /// The feed was shut down.
    Stopped,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_config_default() {
        let config = FeedConfig::default();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = FeedConfig {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(5), Duration::from_secs(10));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_with_jitter_stays_in_range() {
        let config = FeedConfig {
            reconnect_base_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = config.backoff_with_jitter(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_feed_status_display() {
        assert_eq!(FeedStatus::Connected.to_string(), "connected");
        assert_eq!(FeedStatus::Unavailable.to_string(), "unavailable");
    }
}
