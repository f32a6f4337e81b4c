//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{Response, Task};
use crate::error::WorkerError;
use crate::ports::Worker;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Mode {
    Ok,
    Fail,
    /// Never answers in any timeout a test uses.
    Hang,
}

/// Worker whose behaviour is switched by the test.
///
/// Every call is announced on the `started` channel before it is answered.
pub(crate) struct ScriptedWorker {
    mode: Mutex<Mode>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    started: mpsc::UnboundedSender<Task>,
}

impl ScriptedWorker {
    pub(crate) fn new(mode: Mode) -> (Arc<Self>, mpsc::UnboundedReceiver<Task>) {
        let (started, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            mode: Mutex::new(mode),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            started,
        });
        (worker, rx)
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Fail the next `n` calls regardless of mode.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn call(&self, task: Task) -> Result<Response, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(task);

        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(WorkerError::new("injected failure"));
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Ok => Ok(Response),
            Mode::Fail => Err(WorkerError::new("boom")),
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Response)
            }
        }
    }
}
