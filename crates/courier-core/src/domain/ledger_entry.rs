//! Ledger entries: what the delivery ledger persists, one per line.
//!
//! Wire shape (JSON):
//! ```text
//! {"sequence_nr":7,"recorded_at":"2024-01-01T12:00:00Z",
//!  "event":{"kind":"DeliveryCreated","payload":{"delivery_id":3,"envelope":{...}}}}
//! {"sequence_nr":8,"recorded_at":"...","event":{"kind":"Confirmed","payload":{"delivery_id":3}}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeliveryId, SequenceNr, TaskEnvelope};

/// Lifecycle event of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum LedgerEvent {
    /// A submission was accepted and is pending until confirmed.
    DeliveryCreated {
        delivery_id: DeliveryId,
        envelope: TaskEnvelope,
    },

    /// The worker answered; the delivery is closed.
    Confirmed { delivery_id: DeliveryId },

    /// Redelivery gave up after the configured maximum.
    Abandoned {
        delivery_id: DeliveryId,
        attempts: u32,
    },
}

impl LedgerEvent {
    pub fn delivery_id(&self) -> DeliveryId {
        match self {
            LedgerEvent::DeliveryCreated { delivery_id, .. }
            | LedgerEvent::Confirmed { delivery_id }
            | LedgerEvent::Abandoned { delivery_id, .. } => *delivery_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::DeliveryCreated { .. } => "DeliveryCreated",
            LedgerEvent::Confirmed { .. } => "Confirmed",
            LedgerEvent::Abandoned { .. } => "Abandoned",
        }
    }
}

/// A ledger event stamped with its position and commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence_nr: SequenceNr,
    pub recorded_at: DateTime<Utc>,
    pub event: LedgerEvent,
}

impl LedgerEntry {
    pub fn new(sequence_nr: SequenceNr, recorded_at: DateTime<Utc>, event: LedgerEvent) -> Self {
        Self {
            sequence_nr,
            recorded_at,
            event,
        }
    }
}
