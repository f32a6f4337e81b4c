//! Redelivery and backpressure policies.

use std::time::Duration;

use crate::config::DeliveryConfig;

/// How often and how many times an unconfirmed delivery is re-issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Period of the redelivery tick.
    pub redeliver_interval: Duration,

    /// Redeliveries allowed after the first attempt. `None` retries forever.
    pub max_redeliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn default_v1() -> Self {
        Self {
            redeliver_interval: Duration::from_secs(1),
            max_redeliveries: None,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            redeliver_interval: config.redeliver_interval,
            max_redeliveries: config.max_redeliveries,
        }
    }

    /// Has a delivery with `attempts` failed attempts used up its budget?
    ///
    /// The first attempt is not a redelivery: with `max_redeliveries = Some(2)`
    /// a delivery is exhausted after its third failed attempt.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        match self.max_redeliveries {
            None => false,
            Some(max) => attempts > max,
        }
    }
}

/// Bound on pending deliveries, with an optional low watermark.
///
/// Once `max_pending` is reached the tracker stays throttled until the pending
/// count drops to `resume_below`. Without a watermark it accepts again as soon
/// as there is room for one more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLimit {
    pub max_pending: usize,
    pub resume_below: Option<usize>,
}

impl PendingLimit {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_pending: config.max_pending_deliveries,
            resume_below: config.resume_pending_deliveries,
        }
    }

    /// Throttle state after observing `pending`, given the previous state.
    pub fn is_throttled(&self, pending: usize, was_throttled: bool) -> bool {
        if pending >= self.max_pending {
            return true;
        }
        if was_throttled {
            let resume_at = self
                .resume_below
                .unwrap_or_else(|| self.max_pending.saturating_sub(1));
            return pending > resume_at;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, 0, false)]
    #[case(None, 1_000, false)]
    #[case(Some(0), 0, false)]
    #[case(Some(0), 1, true)]
    #[case(Some(2), 2, false)]
    #[case(Some(2), 3, true)]
    fn exhaustion(#[case] max: Option<u32>, #[case] attempts: u32, #[case] exhausted: bool) {
        let policy = RedeliveryPolicy {
            max_redeliveries: max,
            ..RedeliveryPolicy::default_v1()
        };
        assert_eq!(policy.is_exhausted(attempts), exhausted);
    }

    #[rstest]
    #[case(2, false, false)]
    #[case(3, false, true)]
    #[case(4, false, true)]
    #[case(2, true, false)]
    fn limit_without_watermark(
        #[case] pending: usize,
        #[case] was_throttled: bool,
        #[case] throttled: bool,
    ) {
        let limit = PendingLimit {
            max_pending: 3,
            resume_below: None,
        };
        assert_eq!(limit.is_throttled(pending, was_throttled), throttled);
    }

    #[test]
    fn watermark_holds_throttle_until_drained() {
        let limit = PendingLimit {
            max_pending: 4,
            resume_below: Some(1),
        };

        let mut throttled = limit.is_throttled(4, false);
        assert!(throttled);

        for pending in [3, 2] {
            throttled = limit.is_throttled(pending, throttled);
            assert!(throttled, "still throttled at {pending}");
        }

        throttled = limit.is_throttled(1, throttled);
        assert!(!throttled);
        // and stays open on the way back up
        assert!(!limit.is_throttled(3, throttled));
    }
}
