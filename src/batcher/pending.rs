//! Queued writes and their completion tickets.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::domain::ports::WriteOp;
use crate::error::{Error, Result};

/// A mutation waiting in the batcher queue
#[derive(Debug)]
pub struct PendingWrite {
    pub op: WriteOp,
    pub enqueued_at: Instant,
    /// Failed commit attempts so far
    pub attempts: u32,
    notify: Option<oneshot::Sender<Result<()>>>,
}

impl PendingWrite {
    pub fn new(op: WriteOp) -> Self {
        Self {
            op,
            enqueued_at: Instant::now(),
            attempts: 0,
            notify: None,
        }
    }

    /// Create a pending write plus the ticket its caller can await
    pub fn with_ticket(op: WriteOp) -> (Self, WriteTicket) {
        let (tx, rx) = oneshot::channel();
        let mut pending = Self::new(op);
        pending.notify = Some(tx);
        (pending, WriteTicket { rx })
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.op.collection, self.op.id)
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn has_waiter(&self) -> bool {
        self.notify.is_some()
    }

    /// Tell a waiting caller the write committed
    pub(crate) fn complete(mut self) {
        if let Some(tx) = self.notify.take() {
            // Receiver gone means nobody is waiting any more
            let _ = tx.send(Ok(()));
        }
    }

    /// Tell a waiting caller the write was dropped
    pub(crate) fn fail(mut self, reason: &str) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(Err(Error::BatchCommitFailed {
                collection: self.op.collection.clone(),
                id: self.op.id.clone(),
                attempts: self.attempts,
                reason: reason.to_string(),
            }));
        }
    }
}

/// Handle to the outcome of a deferred write
#[derive(Debug)]
pub struct WriteTicket {
    rx: oneshot::Receiver<Result<()>>,
}

impl WriteTicket {
    /// Wait until the write is committed or dropped
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| Error::ShuttingDown)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Payload, WriteKind};
    use assert_matches::assert_matches;

    fn op() -> WriteOp {
        WriteOp::new("users", "1", WriteKind::Set, Payload::new())
    }

    #[tokio::test]
    async fn test_ticket_completes() {
        let (pending, ticket) = PendingWrite::with_ticket(op());
        assert!(pending.has_waiter());
        assert_eq!(pending.key(), "users/1");
        pending.complete();
        assert!(ticket.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_ticket_reports_failure() {
        let (mut pending, ticket) = PendingWrite::with_ticket(op());
        pending.attempts = 4;
        pending.fail("backend unavailable");
        assert_matches!(
            ticket.wait().await,
            Err(Error::BatchCommitFailed { attempts: 4, .. })
        );
    }

    #[test]
    fn test_ticket_pending_until_completed() {
        let (pending, ticket) = PendingWrite::with_ticket(op());
        let mut wait = tokio_test::task::spawn(ticket.wait());
        tokio_test::assert_pending!(wait.poll());

        pending.complete();
        assert!(wait.is_woken());
        let result = tokio_test::assert_ready!(wait.poll());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_pending_means_shutdown() {
        let (pending, ticket) = PendingWrite::with_ticket(op());
        drop(pending);
        assert_matches!(ticket.wait().await, Err(Error::ShuttingDown));
    }
}
