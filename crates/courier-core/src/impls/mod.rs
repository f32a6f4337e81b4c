//! Impls - implementations of the ports.
//!
//! - **FileLedger**: durable JSON-lines ledger
//! - **InMemoryLedger**: non-durable ledger for tests and demos

pub mod file_ledger;
pub mod inmem_ledger;

pub use self::file_ledger::FileLedger;
pub use self::inmem_ledger::InMemoryLedger;
