//! Runtime configuration.
//!
//! Every knob is a tunable: `default_v1()` carries the example values used by the
//! demo driver, nothing in the core depends on them. Durations are stored as
//! integer milliseconds in JSON (`*_ms` keys).
//!
//! ```json
//! {
//!   "breaker": { "max_failures": 2, "call_timeout_ms": 100, "reset_timeout_ms": 2000 },
//!   "delivery": {
//!     "redeliver_interval_ms": 1000,
//!     "max_redeliveries": null,
//!     "max_pending_deliveries": 50,
//!     "resume_pending_deliveries": null,
//!     "attempt_timeout_ms": 5000
//!   },
//!   "mailbox_capacity": 256
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Circuit breaker tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures (while Closed) that open the breaker.
    pub max_failures: u32,

    /// Upper bound of every call through the breaker.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,

    /// Time spent Open before a trial call is let through.
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
}

/// Delivery tracker tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Period of the redelivery ticker.
    #[serde(rename = "redeliver_interval_ms", with = "duration_ms")]
    pub redeliver_interval: Duration,

    /// Redeliveries allowed after the first attempt. `None` retries forever.
    #[serde(default)]
    pub max_redeliveries: Option<u32>,

    /// Pending (unconfirmed) deliveries at which submissions are rejected.
    pub max_pending_deliveries: usize,

    /// Low watermark: once throttled, accept again only at or below this count.
    #[serde(default)]
    pub resume_pending_deliveries: Option<usize>,

    /// Idle timeout of a single delivery attempt (the per-attempt mediator).
    #[serde(rename = "attempt_timeout_ms", with = "duration_ms")]
    pub attempt_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierConfig {
    pub breaker: BreakerConfig,
    pub delivery: DeliveryConfig,

    /// Bounded mailbox size of the gate and dispatcher loops.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_mailbox_capacity() -> usize {
    256
}

impl CourierConfig {
    /// Example values: maxFailures=2, callTimeout=100ms, resetTimeout=2s.
    pub fn default_v1() -> Self {
        Self {
            breaker: BreakerConfig {
                max_failures: 2,
                call_timeout: Duration::from_millis(100),
                reset_timeout: Duration::from_secs(2),
            },
            delivery: DeliveryConfig {
                redeliver_interval: Duration::from_secs(1),
                max_redeliveries: None,
                max_pending_deliveries: 50,
                resume_pending_deliveries: None,
                attempt_timeout: Duration::from_secs(5),
            },
            mailbox_capacity: default_mailbox_capacity(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values the state machines cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.breaker;
        let d = &self.delivery;

        if b.max_failures == 0 {
            return Err(ConfigError::Invalid("breaker.max_failures must be >= 1".into()));
        }
        if b.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("breaker.call_timeout_ms must be > 0".into()));
        }
        if b.reset_timeout.is_zero() {
            return Err(ConfigError::Invalid("breaker.reset_timeout_ms must be > 0".into()));
        }
        if d.redeliver_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "delivery.redeliver_interval_ms must be > 0".into(),
            ));
        }
        if d.attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid("delivery.attempt_timeout_ms must be > 0".into()));
        }
        if d.max_pending_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_pending_deliveries must be >= 1".into(),
            ));
        }
        if let Some(resume) = d.resume_pending_deliveries
            && resume >= d.max_pending_deliveries
        {
            return Err(ConfigError::Invalid(format!(
                "delivery.resume_pending_deliveries ({resume}) must be below \
                 max_pending_deliveries ({})",
                d.max_pending_deliveries
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("mailbox_capacity must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// `Duration` <-> integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_v1_is_valid() {
        let config = CourierConfig::default_v1();
        config.validate().unwrap();
        assert_eq!(config.breaker.max_failures, 2);
        assert_eq!(config.breaker.call_timeout, Duration::from_millis(100));
    }

    #[test]
    fn parses_millisecond_keys() {
        let raw = r#"{
            "breaker": { "max_failures": 3, "call_timeout_ms": 250, "reset_timeout_ms": 5000 },
            "delivery": {
                "redeliver_interval_ms": 1000,
                "max_redeliveries": 4,
                "max_pending_deliveries": 5,
                "resume_pending_deliveries": 2,
                "attempt_timeout_ms": 60000
            }
        }"#;

        let config = CourierConfig::from_json_str(raw).unwrap();
        assert_eq!(config.breaker.call_timeout, Duration::from_millis(250));
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(5));
        assert_eq!(config.delivery.max_redeliveries, Some(4));
        assert_eq!(config.delivery.resume_pending_deliveries, Some(2));
        assert_eq!(config.mailbox_capacity, 256);
    }

    #[rstest]
    #[case::zero_failures(|c: &mut CourierConfig| c.breaker.max_failures = 0)]
    #[case::zero_call_timeout(|c: &mut CourierConfig| c.breaker.call_timeout = Duration::ZERO)]
    #[case::zero_reset_timeout(|c: &mut CourierConfig| c.breaker.reset_timeout = Duration::ZERO)]
    #[case::zero_interval(|c: &mut CourierConfig| c.delivery.redeliver_interval = Duration::ZERO)]
    #[case::zero_pending(|c: &mut CourierConfig| c.delivery.max_pending_deliveries = 0)]
    #[case::watermark_above_max(|c: &mut CourierConfig| {
        c.delivery.resume_pending_deliveries = Some(50)
    })]
    fn rejects_unusable_values(#[case] mutate: fn(&mut CourierConfig)) {
        let mut config = CourierConfig::default_v1();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = CourierConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
