//! Breaker - circuit breaker around the worker.
//!
//! - **CircuitBreaker**: the Closed/Open/HalfOpen state machine
//! - **CallGate**: task owning a breaker; calls the worker with a timeout

pub mod gate;
pub mod state;

pub use self::gate::{CallGate, CallGateHandle};
pub use self::state::{
    Admission, BreakerListener, CircuitBreaker, CircuitState, Permit, TracingListener,
};
