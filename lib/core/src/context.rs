use std::time::Duration;

use futures::future::{pending, select_all};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::OrchestratorError;

/// Request scoped cancellation, deadline and idempotency key
///
/// A `Context` is cheap to clone. Child contexts created with
/// [Context::with_timeout] or [Context::with_cancel] observe every signal of
/// their parent plus their own.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel_receivers: Vec<watch::Receiver<bool>>,
    idempotency_key: Option<String>,
}

/// Cancels the context it was created with, and every child of it
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a child context whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        child
    }

    /// Returns a child context together with the handle that cancels it
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut child = self.clone();
        child.cancel_receivers.push(receiver);
        (child, CancelHandle { sender })
    }

    pub fn with_idempotency_key(&self, key: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.idempotency_key = Some(key.into());
        child
    }

    /// Drops cancellation and deadline but keeps request values.
    /// Used for work that must outlive the request that started it.
    pub fn detached(&self) -> Self {
        Self {
            deadline: None,
            cancel_receivers: Vec::new(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_receivers.iter().any(|receiver| *receiver.borrow())
    }

    /// The reason the context is done, or `None` while it is still live
    pub fn err(&self) -> Option<OrchestratorError> {
        if self.is_cancelled() {
            return Some(OrchestratorError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(OrchestratorError::DeadlineExceeded)
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        let cancelled = async {
            if self.cancel_receivers.is_empty() {
                return pending::<()>().await;
            }
            let waits = self.cancel_receivers.iter().cloned().map(|mut receiver| {
                Box::pin(async move {
                    // A dropped handle can no longer cancel
                    if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
                        pending::<()>().await;
                    }
                })
            });
            select_all(waits).await;
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => {}
            _ = expired => {}
        }
    }
}
