//! Delivery record: envelope + delivery bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryId, TaskEnvelope};

/// Delivery state.
///
/// State transitions:
/// - Pending -> InFlight -> Confirmed
/// - Pending -> InFlight -> Pending (attempt failed or was rejected, waits for the next tick)
/// - Pending -> Abandoned (redelivery budget used up)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Waiting for the next attempt.
    Pending,

    /// An attempt is outstanding.
    InFlight,

    Confirmed,

    /// Given up on; published as a dead letter.
    Abandoned,
}

/// One logical submission. Redelivery reuses the same record and id.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub delivery_id: DeliveryId,
    pub envelope: TaskEnvelope,
    pub state: DeliveryState,

    /// Attempts that reached the worker and failed, in this process
    /// (not persisted; zero after recovery). This is what the redelivery bound counts.
    pub attempts: u32,

    /// Attempts turned away before reaching the worker (open circuit, gate stopped).
    pub rejections: u32,

    pub last_error: Option<String>,

    /// When the `DeliveryCreated` entry was recorded.
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(delivery_id: DeliveryId, envelope: TaskEnvelope, created_at: DateTime<Utc>) -> Self {
        Self {
            delivery_id,
            envelope,
            state: DeliveryState::Pending,
            attempts: 0,
            rejections: 0,
            last_error: None,
            created_at,
        }
    }

    /// Has any earlier attempt been issued for this record?
    pub fn was_attempted(&self) -> bool {
        self.attempts + self.rejections > 0
    }

    pub fn start_attempt(&mut self) {
        self.state = DeliveryState::InFlight;
    }

    /// The worker was called and failed (or timed out).
    pub fn fail_attempt(&mut self, error: String) {
        self.state = DeliveryState::Pending;
        self.attempts += 1;
        self.last_error = Some(error);
    }

    /// The attempt never reached the worker.
    pub fn reject_attempt(&mut self, error: String) {
        self.state = DeliveryState::Pending;
        self.rejections += 1;
        self.last_error = Some(error);
    }

    pub fn mark_confirmed(&mut self) {
        self.state = DeliveryState::Confirmed;
    }

    pub fn mark_abandoned(&mut self) {
        self.state = DeliveryState::Abandoned;
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DeliveryState::Confirmed
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == DeliveryState::InFlight
    }
}
