//! Observability: status snapshots and tracing setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::breaker::CircuitState;

/// Delivery tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    /// Unconfirmed deliveries (idle or in flight).
    pub pending: usize,
    /// Pending deliveries with an attempt outstanding.
    pub in_flight: usize,
    pub submitted: u64,
    pub confirmed: u64,
    pub redelivered: u64,
    pub abandoned: u64,
    pub rejected: u64,
}

/// Circuit breaker state and lifetime counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub opened: u64,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). Safe to call more than once:
/// an already-installed subscriber is kept.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("global tracing subscriber already installed; keeping it");
    }
}
