//! Ports - the seams to everything outside the core.
//!
//! - `Worker`: the downstream the breaker protects
//! - `DeliveryLedger`: durable storage of delivery events
//! - `Clock` / `IdGenerator`: time and identity, swappable in tests

pub mod clock;
pub mod id_generator;
pub mod ledger;
pub mod worker;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ledger::DeliveryLedger;
pub use self::worker::Worker;
