//! Pending-request table
//!
//! Maps a correlation token to the caller waiting for its confirmation.
//! An entry leaves the table when the confirmation arrives, when the
//! caller gives up (timeout or cancellation drops the `PendingRequest`),
//! or when the whole table is failed during teardown.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::transport::{CorrelationToken, SessionInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Confirmed(SessionInfo),
    Rejected(SessionInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    TimedOut,
    /// The table was failed before a confirmation arrived.
    Cancelled,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    table: Mutex<HashMap<CorrelationToken, oneshot::Sender<RequestOutcome>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new request under a fresh token.
    pub fn register(&self) -> PendingRequest<'_> {
        let token = CorrelationToken::new();
        let (tx, rx) = oneshot::channel();
        self.table.lock().insert(token, tx);
        PendingRequest {
            token,
            rx,
            table: self,
        }
    }

    /// Hand `outcome` to the request waiting on `token`.
    ///
    /// Returns false when nobody is waiting any more (late or unknown
    /// confirmation).
    pub fn resolve(&self, token: CorrelationToken, outcome: RequestOutcome) -> bool {
        match self.table.lock().remove(&token) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Wake every waiter with `Cancelled`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.table.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn forget(&self, token: &CorrelationToken) {
        self.table.lock().remove(token);
    }
}

/// One outstanding request. Dropping it withdraws the token.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    token: CorrelationToken,
    rx: oneshot::Receiver<RequestOutcome>,
    table: &'a PendingRequests,
}

impl PendingRequest<'_> {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub async fn wait(mut self, limit: Duration) -> Result<RequestOutcome, WaitError> {
        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(WaitError::Cancelled),
            Err(_) => Err(WaitError::TimedOut),
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.table.forget(&self.token);
    }
}
