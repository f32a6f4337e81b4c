//! courier-core
//!
//! Breaker-guarded, durable at-least-once delivery of tasks to a worker.
//!
//! # Modules
//! - **domain**: ids, tasks, ledger entries
//! - **ports**: seams to the outside (Worker, DeliveryLedger, Clock, IdGenerator)
//! - **impls**: FileLedger, InMemoryLedger
//! - **breaker**: circuit breaker state machine and the CallGate loop
//! - **delivery**: DeliveryTracker (ids, pending set, redelivery, recovery)
//! - **app**: Dispatcher and AppBuilder
//! - **config** / **error** / **observability**: tunables, error types, logging

pub mod app;
pub mod breaker;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{App, AppBuilder, DispatcherHandle, Submission};
pub use breaker::{CallGate, CallGateHandle, CircuitState};
pub use config::CourierConfig;
pub use error::{CallError, CourierError, SubmitError, WorkerError};
pub use observability::{LogFormat, init_tracing};
