//! Domain model: identifiers, tasks, ledger entries.

pub mod ids;
pub mod ledger_entry;
pub mod task;

pub use ids::{DeliveryId, RequesterId, SequenceNr};
pub use ledger_entry::{LedgerEntry, LedgerEvent};
pub use task::{Response, Task, TaskEnvelope};
