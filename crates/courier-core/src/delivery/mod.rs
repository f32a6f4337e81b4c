//! Delivery - durable at-least-once tracking.

pub mod policy;
pub mod record;
pub mod tracker;

pub use self::policy::{PendingLimit, RedeliveryPolicy};
pub use self::record::{DeliveryRecord, DeliveryState};
pub use self::tracker::{DeadLetter, DeliveryTracker, DueDeliveries, RecoveryReport};
