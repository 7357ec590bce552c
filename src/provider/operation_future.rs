use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::ClientError;

/// A one-shot completion handle for a request issued to the transport layer.
///
/// Clones share the same completion state: the transport keeps one clone to complete it from its
///  I/O context, the issuer keeps another to wait on. The first call to [OperationFuture::complete]
///  or [OperationFuture::fail] wins, later calls are no-ops.
///
/// A wait that times out leaves the future untouched, so waiting again later still observes the
///  eventual result.
#[derive(Clone)]
pub struct OperationFuture {
    inner: Arc<OperationState>,
}

struct OperationState {
    result: Mutex<Option<Result<(), ClientError>>>,
    completed: Notify,
}

impl Debug for OperationFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperationFuture{{result:{:?}}}", &*self.inner.result.lock())
    }
}

impl Default for OperationFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationFuture {
    pub fn new() -> OperationFuture {
        OperationFuture {
            inner: Arc::new(OperationState {
                result: Mutex::new(None),
                completed: Notify::new(),
            }),
        }
    }

    /// convenience for transports that complete a request synchronously
    pub fn completed(result: Result<(), ClientError>) -> OperationFuture {
        let future = OperationFuture::new();
        future.set_result(result);
        future
    }

    /// returns `true` if this call completed the future, `false` if it was already completed
    pub fn complete(&self) -> bool {
        self.set_result(Ok(()))
    }

    /// returns `true` if this call completed the future, `false` if it was already completed
    pub fn fail(&self, error: ClientError) -> bool {
        self.set_result(Err(error))
    }

    fn set_result(&self, result: Result<(), ClientError>) -> bool {
        {
            let mut lock = self.inner.result.lock();
            if lock.is_some() {
                return false;
            }
            *lock = Some(result);
        }
        self.inner.completed.notify_waiters();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.inner.result.lock().is_some()
    }

    /// Wait for the request's outcome. `None` waits without a deadline.
    pub async fn wait(&self, deadline: Option<Duration>) -> Result<(), ClientError> {
        match deadline {
            None => self.wait_for_result().await,
            Some(d) => {
                match timeout(d, self.wait_for_result()).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout(d)),
                }
            }
        }
    }

    async fn wait_for_result(&self) -> Result<(), ClientError> {
        loop {
            // NB: register interest *before* checking the result so a completion racing with
            //      this check is not lost
            let notified = self.inner.completed.notified();
            if let Some(result) = self.inner.result.lock().as_ref() {
                return result.clone();
            }
            notified.await;
        }
    }
}
