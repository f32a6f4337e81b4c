//! AppBuilder - wiring and startup.
//!
//! - fail fast: missing parts or invalid config are reported before anything runs
//! - the ledger is replayed before the first submission is accepted

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::dispatcher::{Dispatcher, DispatcherHandle};
use crate::breaker::{BreakerListener, CallGate, TracingListener};
use crate::config::CourierConfig;
use crate::delivery::{DeadLetter, DeliveryTracker, RecoveryReport};
use crate::error::{ConfigError, CourierError, LedgerError};
use crate::ports::{DeliveryLedger, IdGenerator, Worker};

/// AppBuilder assembles the gate, the tracker and the dispatcher.
///
/// # Usage
/// ```ignore
/// let app = AppBuilder::new(CourierConfig::default_v1())
///     .worker(Arc::new(MyWorker))
///     .ledger(Arc::new(FileLedger::open("courier-ledger.jsonl").await?))
///     .start()
///     .await?;
/// let submission = app.handle().submit(Task::new(1)).await?;
/// ```
pub struct AppBuilder {
    config: CourierConfig,
    component: String,
    worker: Option<Arc<dyn Worker>>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
    listener: Arc<dyn BreakerListener>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    dead_letters: Option<mpsc::UnboundedSender<DeadLetter>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no worker configured; call AppBuilder::worker")]
    MissingWorker,

    #[error("no delivery ledger configured; call AppBuilder::ledger")]
    MissingLedger,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("ledger recovery failed: {0}")]
    Recovery(#[source] LedgerError),
}

impl AppBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            component: "worker".to_string(),
            worker: None,
            ledger: None,
            listener: Arc::new(TracingListener),
            id_generator: None,
            dead_letters: None,
        }
    }

    /// Name of the guarded component, used in logs and `CircuitOpen` errors.
    pub fn component(mut self, name: impl Into<String>) -> Self {
        self.component = name.into();
        self
    }

    pub fn worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn DeliveryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(ids);
        self
    }

    pub fn dead_letters(mut self, tx: mpsc::UnboundedSender<DeadLetter>) -> Self {
        self.dead_letters = Some(tx);
        self
    }

    /// Validate, recover the ledger, and start the gate and dispatcher loops.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let worker = self.worker.ok_or(BuildError::MissingWorker)?;
        let ledger = self.ledger.ok_or(BuildError::MissingLedger)?;

        let mut tracker = DeliveryTracker::from_config(ledger, &self.config.delivery);
        let recovery = tracker.recover().await.map_err(BuildError::Recovery)?;

        let (gate, gate_join) = CallGate::spawn(
            self.component,
            self.config.breaker.clone(),
            worker,
            self.listener,
            self.config.mailbox_capacity,
        );

        let (mut dispatcher, handle) = Dispatcher::new(
            tracker,
            gate,
            self.config.delivery.attempt_timeout,
            self.config.mailbox_capacity,
        );
        if let Some(ids) = self.id_generator {
            dispatcher = dispatcher.with_id_generator(ids);
        }
        if let Some(tx) = self.dead_letters {
            dispatcher = dispatcher.with_dead_letters(tx);
        }
        let dispatcher_join = dispatcher.spawn();

        info!(
            resumed = recovery.resumed,
            next_delivery_id = %recovery.next_delivery_id,
            "courier started"
        );

        Ok(App {
            handle,
            recovery,
            dispatcher: dispatcher_join,
            gate: gate_join,
        })
    }
}

/// A running courier: gate + dispatcher.
pub struct App {
    handle: DispatcherHandle,
    recovery: RecoveryReport,
    dispatcher: JoinHandle<()>,
    gate: JoinHandle<()>,
}

impl App {
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// What startup recovery found in the ledger.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop both loops and wait for them.
    pub async fn shutdown_and_join(self) -> Result<(), CourierError> {
        self.handle.shutdown().await;
        self.dispatcher
            .await
            .map_err(|e| CourierError::Other(format!("dispatcher task failed: {e}")))?;
        self.gate
            .await
            .map_err(|e| CourierError::Other(format!("call gate task failed: {e}")))?;
        Ok(())
    }
}
