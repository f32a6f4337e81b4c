//! App - wiring of the breaker and the delivery tracker.
//!
//! - **AppBuilder**: validation, recovery, startup
//! - **Dispatcher**: receives tasks, persists them, calls through the gate,
//!   confirms, and redelivers on a timer

pub mod builder;
pub mod dispatcher;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::dispatcher::{Dispatcher, DispatcherHandle, Submission};
