//! Worker port - the downstream component tasks are delivered to.

use async_trait::async_trait;

use crate::domain::{Response, Task};
use crate::error::WorkerError;

/// The worker processes one task and answers with a response.
///
/// The caller bounds every call with its own timeout, so an implementation may
/// take arbitrarily long; a slow call is cancelled by dropping its future.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn call(&self, task: Task) -> Result<Response, WorkerError>;
}
