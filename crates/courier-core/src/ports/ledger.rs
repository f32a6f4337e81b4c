//! DeliveryLedger port - durable, append-only log of delivery lifecycle events.
//!
//! # Implementations
//! - `FileLedger`: JSON lines + fsync (production)
//! - `InMemoryLedger`: shared in-memory storage (tests, demos)

use async_trait::async_trait;

use crate::domain::{LedgerEntry, LedgerEvent};
use crate::error::LedgerError;

/// DeliveryLedger is the source of truth for which deliveries are still pending.
///
/// # Contract
/// - `append` returns only after the entry is durably committed; the caller must
///   not treat the matching in-memory change as committed before that
/// - the ledger assigns strictly increasing sequence numbers
/// - `replay` yields entries in append order
/// - the tracker is the only writer
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry, LedgerError>;

    async fn replay(&self) -> Result<Vec<LedgerEntry>, LedgerError>;
}
