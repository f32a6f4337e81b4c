//! Dispatcher - breaker-guarded calls with durable delivery.
//!
//! # Flow
//! 1. `Submit`: `DeliveryTracker::submit` (persisted), then one attempt
//! 2. attempt: a short-lived mediator calls the `CallGate` bounded by
//!    `attempt_timeout` and posts the outcome back into this loop
//! 3. success: `DeliveryTracker::confirm`, then the response goes to the requester
//! 4. failure (timeout, worker error, open circuit): the record stays pending;
//!    only timeouts and worker errors count toward `max_redeliveries`
//! 5. every `redeliver_interval` of the tracker's policy: re-issue idle pending
//!    records, abandon exhausted ones
//!
//! Everything that touches the tracker runs inside the single `run` loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::breaker::CallGateHandle;
use crate::delivery::{DeadLetter, DeliveryTracker};
use crate::domain::{DeliveryId, RequesterId, Response, Task};
use crate::error::{CallError, SubmitError};
use crate::observability::DeliveryCounts;
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

/// An accepted submission.
#[derive(Debug)]
pub struct Submission {
    pub delivery_id: DeliveryId,
    /// Resolves once the delivery is confirmed. Closed if the dispatcher stops
    /// first or the delivery is abandoned.
    pub response: oneshot::Receiver<Response>,
}

enum DispatcherCommand {
    Submit {
        task: Task,
        reply: oneshot::Sender<Result<Submission, SubmitError>>,
    },
    Counts {
        reply: oneshot::Sender<DeliveryCounts>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct AttemptOutcome {
    delivery_id: DeliveryId,
    result: Result<Response, CallError>,
}

/// Cloneable client side of a running `Dispatcher`.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<DispatcherCommand>,
    gate: CallGateHandle,
}

impl DispatcherHandle {
    pub async fn submit(&self, task: Task) -> Result<Submission, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DispatcherCommand::Submit { task, reply })
            .await
            .map_err(|_| SubmitError::DispatcherClosed)?;
        rx.await.map_err(|_| SubmitError::DispatcherClosed)?
    }

    /// `None` once the dispatcher has stopped.
    pub async fn counts(&self) -> Option<DeliveryCounts> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DispatcherCommand::Counts { reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// The gate the dispatcher calls through.
    pub fn breaker(&self) -> &CallGateHandle {
        &self.gate
    }

    /// Stop the dispatcher (and its gate) and wait for the loop to exit.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self
            .commands
            .send(DispatcherCommand::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

pub struct Dispatcher {
    tracker: DeliveryTracker,
    gate: CallGateHandle,
    ids: Arc<dyn IdGenerator>,
    /// Live reply channels, by requester. Not persisted.
    requesters: HashMap<RequesterId, oneshot::Sender<Response>>,
    dead_letters: Option<mpsc::UnboundedSender<DeadLetter>>,
    commands: mpsc::Receiver<DispatcherCommand>,
    outcomes_tx: mpsc::UnboundedSender<AttemptOutcome>,
    outcomes: mpsc::UnboundedReceiver<AttemptOutcome>,
    attempt_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        tracker: DeliveryTracker,
        gate: CallGateHandle,
        attempt_timeout: Duration,
        mailbox_capacity: usize,
    ) -> (Self, DispatcherHandle) {
        let (tx, commands) = mpsc::channel(mailbox_capacity.max(1));
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();

        let dispatcher = Self {
            tracker,
            gate: gate.clone(),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            requesters: HashMap::new(),
            dead_letters: None,
            commands,
            outcomes_tx,
            outcomes,
            attempt_timeout,
        };
        let handle = DispatcherHandle { commands: tx, gate };
        (dispatcher, handle)
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Publish abandoned deliveries on `tx`.
    pub fn with_dead_letters(mut self, tx: mpsc::UnboundedSender<DeadLetter>) -> Self {
        self.dead_letters = Some(tx);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let interval = self.tracker.policy().redeliver_interval;
        let mut redeliver = tokio::time::interval_at(Instant::now() + interval, interval);
        redeliver.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                biased;

                Some(outcome) = self.outcomes.recv() => self.on_outcome(outcome).await,

                command = self.commands.recv() => match command {
                    Some(DispatcherCommand::Submit { task, reply }) => {
                        let result = self.submit(task).await;
                        let _ = reply.send(result);
                    }
                    Some(DispatcherCommand::Counts { reply }) => {
                        let _ = reply.send(self.tracker.counts());
                    }
                    Some(DispatcherCommand::Shutdown { done }) => {
                        shutdown_ack = Some(done);
                        break;
                    }
                    None => break,
                },

                _ = redeliver.tick() => self.redeliver().await,
            }
        }

        self.gate.shutdown().await;
        let counts = self.tracker.counts();
        info!(
            pending = counts.pending,
            submitted = counts.submitted,
            confirmed = counts.confirmed,
            redelivered = counts.redelivered,
            abandoned = counts.abandoned,
            rejected = counts.rejected,
            "dispatcher stopped"
        );
        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
    }

    async fn submit(&mut self, task: Task) -> Result<Submission, SubmitError> {
        let requester = self.ids.generate_requester_id();
        let delivery_id = self.tracker.submit(task, requester).await?;

        let (tx, response) = oneshot::channel();
        self.requesters.insert(requester, tx);
        self.attempt(delivery_id);

        Ok(Submission {
            delivery_id,
            response,
        })
    }

    /// Spawn the per-attempt mediator for one pending delivery.
    fn attempt(&mut self, delivery_id: DeliveryId) {
        let Some(task) = self.tracker.begin_attempt(delivery_id) else {
            return;
        };

        let gate = self.gate.clone();
        let outcomes = self.outcomes_tx.clone();
        let attempt_timeout = self.attempt_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(attempt_timeout, gate.call(task)).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout {
                    after: attempt_timeout,
                }),
            };
            let _ = outcomes.send(AttemptOutcome {
                delivery_id,
                result,
            });
        });
    }

    async fn on_outcome(&mut self, outcome: AttemptOutcome) {
        let delivery_id = outcome.delivery_id;
        let response = match outcome.result {
            Ok(response) => response,
            Err(e) => {
                self.tracker.attempt_failed(delivery_id, &e);
                return;
            }
        };

        match self.tracker.confirm(delivery_id).await {
            Ok(Some(record)) => self.reply(record.envelope.requester(), delivery_id, response),
            Ok(None) => {}
            Err(e) => {
                error!(
                    %delivery_id,
                    error = %e,
                    "could not persist confirmation; delivery stays pending"
                );
            }
        }
    }

    fn reply(&mut self, requester: RequesterId, delivery_id: DeliveryId, response: Response) {
        match self.requesters.remove(&requester) {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!(%delivery_id, %requester, "requester stopped waiting for the response");
                }
            }
            // submitted before a restart; the reply channel did not survive
            None => info!(%delivery_id, %requester, "delivered task from a previous run"),
        }
    }

    async fn redeliver(&mut self) {
        let due = self.tracker.due_for_redelivery();

        for delivery_id in due.exhausted {
            match self.tracker.abandon(delivery_id).await {
                Ok(Some(dead)) => {
                    self.requesters.remove(&dead.envelope.requester());
                    if let Some(tx) = &self.dead_letters {
                        let _ = tx.send(dead);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        %delivery_id,
                        error = %e,
                        "could not persist abandonment; will retry next tick"
                    );
                }
            }
        }

        if !due.ready.is_empty() {
            debug!(count = due.ready.len(), "redelivering pending deliveries");
        }
        for delivery_id in due.ready {
            self.attempt(delivery_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CallGate, CircuitState, TracingListener};
    use crate::config::{BreakerConfig, CourierConfig};
    use crate::domain::LedgerEvent;
    use crate::impls::InMemoryLedger;
    use crate::testing::{Mode, ScriptedWorker};

    struct Harness {
        handle: DispatcherHandle,
        ledger: InMemoryLedger,
        worker: Arc<ScriptedWorker>,
        started: mpsc::UnboundedReceiver<Task>,
        dead: mpsc::UnboundedReceiver<DeadLetter>,
        join: JoinHandle<()>,
    }

    fn config() -> CourierConfig {
        let mut config = CourierConfig::default_v1();
        config.breaker = BreakerConfig {
            max_failures: 2,
            call_timeout: Duration::from_millis(100),
            reset_timeout: Duration::from_secs(2),
        };
        config.delivery.redeliver_interval = Duration::from_secs(1);
        config
    }

    fn start(config: CourierConfig, mode: Mode) -> Harness {
        let ledger = InMemoryLedger::new();
        let (worker, started) = ScriptedWorker::new(mode);
        let (gate, _gate_join) = CallGate::spawn(
            "worker",
            config.breaker.clone(),
            worker.clone(),
            Arc::new(TracingListener),
            config.mailbox_capacity,
        );
        let tracker = DeliveryTracker::from_config(Arc::new(ledger.clone()), &config.delivery);
        let (dead_tx, dead) = mpsc::unbounded_channel();
        let (dispatcher, handle) = Dispatcher::new(
            tracker,
            gate,
            config.delivery.attempt_timeout,
            config.mailbox_capacity,
        );
        let join = dispatcher.with_dead_letters(dead_tx).spawn();

        Harness {
            handle,
            ledger,
            worker,
            started,
            dead,
            join,
        }
    }

    fn kinds(ledger: &InMemoryLedger) -> Vec<&'static str> {
        ledger.entries().iter().map(|e| e.event.kind()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_delivery_answers_the_requester() {
        let h = start(config(), Mode::Ok);

        let submission = h.handle.submit(Task::new(1)).await.unwrap();
        let response = submission.response.await.unwrap();

        assert_eq!(response, Response);
        assert_eq!(kinds(&h.ledger), vec!["DeliveryCreated", "Confirmed"]);
        let counts = h.handle.counts().await.unwrap();
        assert_eq!(counts.confirmed, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_is_redelivered_with_the_same_id() {
        let h = start(config(), Mode::Ok);
        h.worker.fail_next(1);

        let before = Instant::now();
        let submission = h.handle.submit(Task::new(7)).await.unwrap();
        submission.response.await.unwrap();

        assert!(before.elapsed() >= Duration::from_secs(1));
        assert_eq!(h.worker.calls(), 2);
        let entries = h.ledger.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.event.delivery_id() == submission.delivery_id));
        assert_eq!(h.handle.counts().await.unwrap().redelivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redeliveries_follow_the_interval_with_the_same_id() {
        let mut config = config();
        config.breaker.max_failures = 10;
        let mut h = start(config, Mode::Ok);
        h.worker.fail_next(2);

        let origin = Instant::now();
        let submission = h.handle.submit(Task::new(3)).await.unwrap();
        let mut offsets = Vec::new();
        for _ in 0..3 {
            h.started.recv().await.unwrap();
            offsets.push(origin.elapsed());
        }
        submission.response.await.unwrap();

        for (offset, expected) in offsets.into_iter().zip([0, 1, 2]) {
            let expected = Duration::from_secs(expected);
            assert!(
                offset >= expected && offset < expected + Duration::from_millis(50),
                "call at {offset:?}, expected about {expected:?}"
            );
        }
        assert_eq!(h.worker.calls(), 3);
        assert!(
            h.ledger
                .entries()
                .iter()
                .all(|e| e.event.delivery_id() == submission.delivery_id)
        );
        assert_eq!(kinds(&h.ledger), vec!["DeliveryCreated", "Confirmed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_does_not_spend_the_redelivery_budget() {
        let mut config = config();
        config.breaker.reset_timeout = Duration::from_secs(5);
        config.delivery.max_redeliveries = Some(2);
        let mut h = start(config, Mode::Hang);

        let first = h.handle.submit(Task::new(1)).await.unwrap();
        let second = h.handle.submit(Task::new(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            h.handle.breaker().snapshot().await.unwrap().state,
            CircuitState::Open
        );
        h.worker.set_mode(Mode::Ok);
        let third = h.handle.submit(Task::new(3)).await.unwrap();

        // several ticks hit the open circuit before the trial call goes through
        first.response.await.unwrap();
        second.response.await.unwrap();
        third.response.await.unwrap();

        assert!(h.dead.try_recv().is_err());
        let counts = h.handle.counts().await.unwrap();
        assert_eq!(counts.abandoned, 0);
        assert_eq!(counts.confirmed, 3);
        assert!(!kinds(&h.ledger).contains(&"Abandoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_persisting_while_the_circuit_is_open() {
        let h = start(config(), Mode::Hang);

        let first = h.handle.submit(Task::new(1)).await.unwrap();
        let second = h.handle.submit(Task::new(2)).await.unwrap();
        // both time out at the gate and open the circuit
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            h.handle.breaker().snapshot().await.unwrap().state,
            CircuitState::Open
        );

        let third = h.handle.submit(Task::new(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.worker.calls(), 2);
        let counts = h.handle.counts().await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.in_flight, 0);
        assert!(first.delivery_id < second.delivery_id && second.delivery_id < third.delivery_id);

        // worker recovers: after the reset timeout everything is delivered
        h.worker.set_mode(Mode::Ok);
        third.response.await.unwrap();
        first.response.await.unwrap();
        second.response.await.unwrap();
        assert_eq!(h.handle.counts().await.unwrap().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_is_returned_to_the_caller() {
        let mut config = config();
        config.delivery.max_pending_deliveries = 1;
        let h = start(config, Mode::Hang);

        let _first = h.handle.submit(Task::new(1)).await.unwrap();
        let err = h.handle.submit(Task::new(2)).await.unwrap_err();

        assert!(matches!(err, SubmitError::BackpressureRejected { pending: 1, limit: 1 }));
        assert_eq!(h.ledger.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_is_returned_to_the_caller() {
        let h = start(config(), Mode::Ok);
        h.ledger.fail_appends(1);

        let err = h.handle.submit(Task::new(1)).await.unwrap_err();

        assert!(matches!(err, SubmitError::PersistenceWriteFailure(_)));
        assert_eq!(h.worker.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delivery_goes_to_dead_letters() {
        let mut config = config();
        config.breaker.max_failures = 100;
        config.delivery.max_redeliveries = Some(2);
        let mut h = start(config, Mode::Fail);

        let submission = h.handle.submit(Task::new(9)).await.unwrap();
        let dead = h.dead.recv().await.unwrap();

        assert_eq!(dead.delivery_id, submission.delivery_id);
        assert_eq!(dead.attempts, 3);
        assert_eq!(dead.envelope.task(), Task::new(9));
        assert!(submission.response.await.is_err());
        assert_eq!(
            h.ledger.entries().last().map(|e| e.event.clone()),
            Some(LedgerEvent::Abandoned {
                delivery_id: dead.delivery_id,
                attempts: 3
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let mut h = start(config(), Mode::Ok);
        h.handle.submit(Task::new(1)).await.unwrap();
        let _ = h.started.recv().await;

        h.handle.shutdown().await;
        h.join.await.unwrap();

        assert!(matches!(
            h.handle.submit(Task::new(2)).await,
            Err(SubmitError::DispatcherClosed)
        ));
        assert!(h.handle.counts().await.is_none());
    }
}
