use serde::{Deserialize, Serialize};
use std::fmt;

use super::RequesterId;

/// A unit of work handed to the worker. Created by the producer, read-only after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
}

impl Task {
    pub fn new(id: u64) -> Self {
        Self { id }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task{{id={}}}", self.id)
    }
}

/// Opaque success marker returned by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response;

/// Task + the requester waiting for its response. This is what the ledger persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task: Task,
    requester: RequesterId,
}

impl TaskEnvelope {
    pub fn new(task: Task, requester: RequesterId) -> Self {
        Self { task, requester }
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn requester(&self) -> RequesterId {
        self.requester
    }
}
