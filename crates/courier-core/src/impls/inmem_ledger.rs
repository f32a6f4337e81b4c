//! InMemoryLedger - non-durable ledger for tests and demos.
//!
//! Handles are cheap clones over the same storage, so a test can keep one handle,
//! hand another to a tracker, and later "restart" by building a new tracker over
//! the same entries.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::{LedgerEntry, LedgerEvent, SequenceNr};
use crate::error::LedgerError;
use crate::ports::{Clock, DeliveryLedger, SystemClock};

struct InMemoryLedgerState {
    entries: Vec<LedgerEntry>,
    next_sequence_nr: SequenceNr,
    /// Number of upcoming appends that fail without storing anything.
    injected_failures: usize,
}

/// InMemoryLedger keeps entries in a shared `Vec`.
///
/// # Usage
/// ```ignore
/// let ledger = InMemoryLedger::new();
/// let tracker = DeliveryTracker::from_config(Arc::new(ledger.clone()), &config.delivery);
/// // ... later
/// assert_eq!(ledger.entries().len(), 2);
/// ```
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<InMemoryLedgerState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryLedgerState {
                entries: Vec::new(),
                next_sequence_nr: SequenceNr::first(),
                injected_failures: 0,
            })),
            clock,
        }
    }

    /// Make the next `n` appends fail with `LedgerError::Unavailable`.
    pub fn fail_appends(&self, n: usize) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .injected_failures = n;
    }

    /// Snapshot of everything appended so far.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryLedger {
    async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry, LedgerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| LedgerError::Unavailable("in-memory ledger lock poisoned".into()))?;

        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(LedgerError::Unavailable("injected append failure".into()));
        }

        let entry = LedgerEntry::new(state.next_sequence_nr, self.clock.now(), event);
        state.next_sequence_nr = state.next_sequence_nr.next();
        state.entries.push(entry.clone());
        Ok(entry)
    }

    async fn replay(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| LedgerError::Unavailable("in-memory ledger lock poisoned".into()))?;
        Ok(state.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeliveryId;

    fn confirmed(id: u64) -> LedgerEvent {
        LedgerEvent::Confirmed {
            delivery_id: DeliveryId::new(id),
        }
    }

    #[tokio::test]
    async fn append_assigns_increasing_sequence_numbers() {
        let ledger = InMemoryLedger::new();

        let a = ledger.append(confirmed(1)).await.unwrap();
        let b = ledger.append(confirmed(2)).await.unwrap();

        assert_eq!(a.sequence_nr, SequenceNr::new(1));
        assert_eq!(b.sequence_nr, SequenceNr::new(2));
    }

    #[tokio::test]
    async fn replay_returns_append_order() {
        let ledger = InMemoryLedger::new();
        for id in [3, 1, 2] {
            ledger.append(confirmed(id)).await.unwrap();
        }

        let ids: Vec<u64> = ledger
            .replay()
            .await
            .unwrap()
            .iter()
            .map(|e| e.event.delivery_id().value())
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn injected_failures_store_nothing() {
        let ledger = InMemoryLedger::new();
        ledger.fail_appends(1);

        let err = ledger.append(confirmed(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
        assert!(ledger.is_empty());

        // the failed append does not burn a sequence number
        let entry = ledger.append(confirmed(1)).await.unwrap();
        assert_eq!(entry.sequence_nr, SequenceNr::first());
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let ledger = InMemoryLedger::new();
        let other = ledger.clone();

        ledger.append(confirmed(1)).await.unwrap();

        assert_eq!(other.replay().await.unwrap().len(), 1);
    }
}
