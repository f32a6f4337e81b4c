//! CallGate - the circuit breaker in front of a `Worker`.
//!
//! The gate is a single task that owns the `CircuitBreaker`. Every call goes
//! through its mailbox, so admission and outcome bookkeeping are sequential.
//! Admitted calls run on their own spawned task bounded by `call_timeout`;
//! the outcome is posted back to the gate, applied to the breaker, and only
//! then handed to the caller.
//!
//! ```text
//! caller --Call--> gate loop --spawn--> worker.call (timeout)
//!   ^                 |  ^                   |
//!   |                 |  +----Completion-----+
//!   +-----reply-------+
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::state::{Admission, BreakerListener, CircuitBreaker, Permit};
use crate::config::BreakerConfig;
use crate::domain::{Response, Task};
use crate::error::CallError;
use crate::observability::BreakerSnapshot;
use crate::ports::Worker;

type CallReply = oneshot::Sender<Result<Response, CallError>>;

enum GateCommand {
    Call { task: Task, reply: CallReply },
    Snapshot { reply: oneshot::Sender<BreakerSnapshot> },
    Shutdown,
}

struct Completion {
    permit: Permit,
    result: Result<Response, CallError>,
    reply: CallReply,
}

/// Cloneable client side of a running `CallGate`.
#[derive(Clone)]
pub struct CallGateHandle {
    commands: mpsc::Sender<GateCommand>,
}

impl CallGateHandle {
    /// Call the worker through the breaker.
    ///
    /// Returns `CallError::CircuitOpen` without touching the worker while the
    /// breaker is open (or a half-open trial is already outstanding).
    pub async fn call(&self, task: Task) -> Result<Response, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(GateCommand::Call { task, reply })
            .await
            .map_err(|_| CallError::GateClosed)?;
        rx.await.map_err(|_| CallError::GateClosed)?
    }

    pub async fn snapshot(&self) -> Result<BreakerSnapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(GateCommand::Snapshot { reply })
            .await
            .map_err(|_| CallError::GateClosed)?;
        rx.await.map_err(|_| CallError::GateClosed)
    }

    /// Stop the gate loop. Calls still running are answered with `GateClosed`.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(GateCommand::Shutdown).await;
    }
}

pub struct CallGate {
    breaker: CircuitBreaker,
    worker: Arc<dyn Worker>,
    commands: mpsc::Receiver<GateCommand>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl CallGate {
    pub fn new(
        breaker: CircuitBreaker,
        worker: Arc<dyn Worker>,
        mailbox_capacity: usize,
    ) -> (Self, CallGateHandle) {
        let (tx, commands) = mpsc::channel(mailbox_capacity.max(1));
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let gate = Self {
            breaker,
            worker,
            commands,
            completions_tx,
            completions,
        };
        (gate, CallGateHandle { commands: tx })
    }

    /// Build a breaker from `config` and start the gate loop.
    ///
    /// The loop stops on `CallGateHandle::shutdown` or once every handle is dropped.
    pub fn spawn(
        name: impl Into<String>,
        config: BreakerConfig,
        worker: Arc<dyn Worker>,
        listener: Arc<dyn BreakerListener>,
        mailbox_capacity: usize,
    ) -> (CallGateHandle, JoinHandle<()>) {
        let breaker = CircuitBreaker::new(name, config, Instant::now()).with_listener(listener);
        let (gate, handle) = Self::new(breaker, worker, mailbox_capacity);
        (handle, tokio::spawn(gate.run()))
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(done) = self.completions.recv() => self.complete(done),

                command = self.commands.recv() => match command {
                    Some(GateCommand::Call { task, reply }) => self.admit(task, reply),
                    Some(GateCommand::Snapshot { reply }) => {
                        let _ = reply.send(self.breaker.snapshot());
                    }
                    Some(GateCommand::Shutdown) | None => break,
                },
            }
        }
        debug!(component = %self.breaker.name(), "call gate stopped");
    }

    fn admit(&mut self, task: Task, reply: CallReply) {
        let permit = match self.breaker.try_acquire(Instant::now()) {
            Admission::Admitted(permit) => permit,
            Admission::Rejected => {
                trace!(component = %self.breaker.name(), %task, "rejected by open circuit");
                let _ = reply.send(Err(CallError::CircuitOpen {
                    component: self.breaker.name().to_string(),
                }));
                return;
            }
        };

        let worker = Arc::clone(&self.worker);
        let completions = self.completions_tx.clone();
        let call_timeout = self.breaker.config().call_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(call_timeout, worker.call(task)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(CallError::Failure(e.0)),
                Err(_) => Err(CallError::Timeout {
                    after: call_timeout,
                }),
            };
            // gate gone: dropping `reply` tells the caller
            let _ = completions.send(Completion {
                permit,
                result,
                reply,
            });
        });
    }

    fn complete(&mut self, done: Completion) {
        let now = Instant::now();
        match &done.result {
            Ok(_) => self.breaker.record_success(done.permit, now),
            Err(e) => {
                debug!(component = %self.breaker.name(), error = %e, "call through breaker failed");
                self.breaker.record_failure(done.permit, now);
            }
        }
        // caller may have given up already
        let _ = done.reply.send(done.result);
    }
}
