//! IdGenerator port - mints requester references.
//!
//! Delivery IDs and sequence numbers are counters owned by the tracker and the
//! ledger; only requester references are generated here.

use crate::domain::RequesterId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator mints unique requester references.
///
/// # Thread Safety
/// - `Send + Sync` so a generator can be shared with the dispatcher task
pub trait IdGenerator: Send + Sync {
    fn generate_requester_id(&self) -> RequesterId;
}

/// ULID-based generator.
///
/// The timestamp part comes from the injected clock, so a `FixedClock` gives
/// deterministic timestamps in tests (the random part still differs).
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_requester_id(&self) -> RequesterId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        RequesterId::from(ulid)
    }
}
