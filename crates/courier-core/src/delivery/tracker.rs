//! DeliveryTracker - at-least-once bookkeeping over a `DeliveryLedger`.
//!
//! # Responsibilities
//! - mint `DeliveryId`s (strictly increasing, never reused)
//! - persist every lifecycle change before applying it in memory
//! - keep the pending set bounded (backpressure)
//! - tell the owner which records are due for redelivery
//! - rebuild the pending set from the ledger on startup
//!
//! The tracker does not call anything itself. Its owner (the dispatcher loop)
//! drives it one operation at a time, so it needs `&mut self` and no locks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::policy::{PendingLimit, RedeliveryPolicy};
use super::record::{DeliveryRecord, DeliveryState};
use crate::config::DeliveryConfig;
use crate::domain::{DeliveryId, LedgerEvent, RequesterId, Task, TaskEnvelope};
use crate::error::{CallError, LedgerError, SubmitError};
use crate::observability::DeliveryCounts;
use crate::ports::DeliveryLedger;

/// A delivery that ran out of redeliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub delivery_id: DeliveryId,
    pub envelope: TaskEnvelope,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// When the delivery was first persisted.
    pub created_at: DateTime<Utc>,
}

/// Result of scanning the pending set on a redelivery tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueDeliveries {
    /// Idle pending records to re-issue.
    pub ready: Vec<DeliveryId>,
    /// Idle pending records whose redelivery budget is spent.
    pub exhausted: Vec<DeliveryId>,
}

/// What `recover` found in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries read.
    pub replayed: usize,
    /// Deliveries without a confirmation, now pending again.
    pub resumed: usize,
    pub confirmed: usize,
    pub abandoned: usize,
    pub next_delivery_id: DeliveryId,
}

pub struct DeliveryTracker {
    ledger: Arc<dyn DeliveryLedger>,
    pending: BTreeMap<DeliveryId, DeliveryRecord>,
    next_delivery_id: DeliveryId,
    policy: RedeliveryPolicy,
    limit: PendingLimit,
    throttled: bool,
    totals: DeliveryCounts,
}

impl DeliveryTracker {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        policy: RedeliveryPolicy,
        limit: PendingLimit,
    ) -> Self {
        Self {
            ledger,
            pending: BTreeMap::new(),
            next_delivery_id: DeliveryId::first(),
            policy,
            limit,
            throttled: false,
            totals: DeliveryCounts::default(),
        }
    }

    pub fn from_config(ledger: Arc<dyn DeliveryLedger>, config: &DeliveryConfig) -> Self {
        Self::new(
            ledger,
            RedeliveryPolicy::from_config(config),
            PendingLimit::from_config(config),
        )
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Accept a new submission.
    ///
    /// Backpressure is checked first: a rejected submission writes nothing.
    /// The id is consumed even when the append fails, since the line may have
    /// partially reached storage.
    pub async fn submit(
        &mut self,
        task: Task,
        requester: RequesterId,
    ) -> Result<DeliveryId, SubmitError> {
        let pending = self.pending.len();
        self.throttled = self.limit.is_throttled(pending, self.throttled);
        if self.throttled {
            self.totals.rejected += 1;
            debug!(
                task_id = task.id,
                pending,
                limit = self.limit.max_pending,
                "submission rejected by backpressure"
            );
            return Err(SubmitError::BackpressureRejected {
                pending,
                limit: self.limit.max_pending,
            });
        }

        let delivery_id = self.next_delivery_id;
        self.next_delivery_id = delivery_id.next();

        let envelope = TaskEnvelope::new(task, requester);
        let entry = self
            .ledger
            .append(LedgerEvent::DeliveryCreated {
                delivery_id,
                envelope: envelope.clone(),
            })
            .await
            .map_err(|e| {
                error!(%delivery_id, task_id = task.id, error = %e, "could not persist delivery");
                SubmitError::PersistenceWriteFailure(e)
            })?;

        self.pending.insert(
            delivery_id,
            DeliveryRecord::new(delivery_id, envelope, entry.recorded_at),
        );
        self.totals.submitted += 1;
        debug!(%delivery_id, task_id = task.id, "delivery registered");
        Ok(delivery_id)
    }

    /// Mark a pending record as in flight and hand back its task.
    ///
    /// `None` if the id is not pending or an attempt is already outstanding.
    pub fn begin_attempt(&mut self, delivery_id: DeliveryId) -> Option<Task> {
        let record = self.pending.get_mut(&delivery_id)?;
        if record.is_in_flight() {
            return None;
        }

        if record.was_attempted() {
            self.totals.redelivered += 1;
        }
        record.start_attempt();
        Some(record.envelope.task())
    }

    /// The outstanding attempt failed; the record waits for the next tick.
    ///
    /// Only failures of the worker itself (`Timeout`, `Failure`) spend the
    /// redelivery budget. A call turned away by an open circuit or a stopped
    /// gate is retried without counting.
    pub fn attempt_failed(&mut self, delivery_id: DeliveryId, error: &CallError) {
        let Some(record) = self.pending.get_mut(&delivery_id).filter(|r| r.is_in_flight()) else {
            debug!(%delivery_id, "failure for a delivery with no outstanding attempt");
            return;
        };

        if error.is_breaker_failure() {
            record.fail_attempt(error.to_string());
            debug!(%delivery_id, attempts = record.attempts, %error, "delivery attempt failed");
        } else {
            record.reject_attempt(error.to_string());
            debug!(
                %delivery_id,
                rejections = record.rejections,
                %error,
                "delivery attempt rejected"
            );
        }
    }

    /// Record a successful delivery.
    ///
    /// Unknown or already confirmed ids are a no-op (`Ok(None)`). If the
    /// confirmation cannot be persisted the record stays pending and will be
    /// delivered again.
    pub async fn confirm(
        &mut self,
        delivery_id: DeliveryId,
    ) -> Result<Option<DeliveryRecord>, LedgerError> {
        if !self.pending.contains_key(&delivery_id) {
            debug!(%delivery_id, "confirmation for unknown or already confirmed delivery ignored");
            return Ok(None);
        }

        if let Err(e) = self.ledger.append(LedgerEvent::Confirmed { delivery_id }).await {
            if let Some(record) = self.pending.get_mut(&delivery_id)
                && record.is_in_flight()
            {
                record.reject_attempt(format!("confirmation not persisted: {e}"));
            }
            return Err(e);
        }

        let Some(mut record) = self.pending.remove(&delivery_id) else {
            return Ok(None);
        };
        record.mark_confirmed();
        self.totals.confirmed += 1;
        debug!(%delivery_id, attempts = record.attempts, "delivery confirmed");
        Ok(Some(record))
    }

    /// Idle pending records, split by whether they may be re-issued.
    pub fn due_for_redelivery(&self) -> DueDeliveries {
        let mut due = DueDeliveries::default();
        for record in self.pending.values() {
            if record.state != DeliveryState::Pending {
                continue;
            }
            if self.policy.is_exhausted(record.attempts) {
                due.exhausted.push(record.delivery_id);
            } else {
                due.ready.push(record.delivery_id);
            }
        }
        due
    }

    /// Give up on a delivery: persist `Abandoned` and drop it from the pending set.
    pub async fn abandon(
        &mut self,
        delivery_id: DeliveryId,
    ) -> Result<Option<DeadLetter>, LedgerError> {
        let Some(attempts) = self.pending.get(&delivery_id).map(|r| r.attempts) else {
            return Ok(None);
        };

        self.ledger
            .append(LedgerEvent::Abandoned {
                delivery_id,
                attempts,
            })
            .await?;

        let Some(mut record) = self.pending.remove(&delivery_id) else {
            return Ok(None);
        };
        record.mark_abandoned();
        self.totals.abandoned += 1;
        warn!(
            %delivery_id,
            task_id = record.envelope.task().id,
            attempts,
            last_error = record.last_error.as_deref().unwrap_or(""),
            "delivery abandoned after exhausting redeliveries"
        );

        Ok(Some(DeadLetter {
            delivery_id,
            envelope: record.envelope,
            attempts,
            last_error: record.last_error,
            created_at: record.created_at,
        }))
    }

    /// Rebuild the pending set from the ledger. Call once, before any `submit`.
    pub async fn recover(&mut self) -> Result<RecoveryReport, LedgerError> {
        let entries = self.ledger.replay().await?;

        let mut pending = BTreeMap::new();
        let mut highest: Option<DeliveryId> = None;
        let mut confirmed = 0;
        let mut abandoned = 0;

        for entry in &entries {
            let delivery_id = entry.event.delivery_id();
            highest = highest.max(Some(delivery_id));

            match &entry.event {
                LedgerEvent::DeliveryCreated { envelope, .. } => {
                    pending.insert(
                        delivery_id,
                        DeliveryRecord::new(delivery_id, envelope.clone(), entry.recorded_at),
                    );
                }
                LedgerEvent::Confirmed { .. } => {
                    if pending.remove(&delivery_id).is_some() {
                        confirmed += 1;
                    }
                }
                LedgerEvent::Abandoned { .. } => {
                    if pending.remove(&delivery_id).is_some() {
                        abandoned += 1;
                    }
                }
            }
        }

        if let Some(highest) = highest {
            self.next_delivery_id = self.next_delivery_id.max(highest.next());
        }
        self.pending = pending;

        let report = RecoveryReport {
            replayed: entries.len(),
            resumed: self.pending.len(),
            confirmed,
            abandoned,
            next_delivery_id: self.next_delivery_id,
        };
        info!(
            replayed = report.replayed,
            resumed = report.resumed,
            confirmed = report.confirmed,
            abandoned = report.abandoned,
            next_delivery_id = %report.next_delivery_id,
            "delivery ledger recovered"
        );
        Ok(report)
    }

    pub fn counts(&self) -> DeliveryCounts {
        DeliveryCounts {
            pending: self.pending.len(),
            in_flight: self.pending.values().filter(|r| r.is_in_flight()).count(),
            ..self.totals.clone()
        }
    }

    pub fn is_pending(&self, delivery_id: DeliveryId) -> bool {
        self.pending.contains_key(&delivery_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn record(&self, delivery_id: DeliveryId) -> Option<&DeliveryRecord> {
        self.pending.get(&delivery_id)
    }
}
