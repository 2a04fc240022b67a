//! The replication checkpoint: the highest log position known to be durably
//! replicated.
//!
//! Replication itself happens elsewhere. This module only carries the
//! checkpoint as a monotonically increasing value that the index committer
//! and the log writer observe.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared, monotonic replication checkpoint.
///
/// Cloning produces a new handle to the same checkpoint.
#[derive(Clone, Debug)]
pub struct ReplicationCheckpoint {
    tx: watch::Sender<i64>,
}

impl ReplicationCheckpoint {
    /// Create a checkpoint starting at `initial`.
    pub fn new(initial: i64) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current checkpoint.
    pub fn current(&self) -> i64 {
        *self.tx.borrow()
    }

    /// Move the checkpoint to `position` if that is an advance.
    ///
    /// # Returns
    ///
    /// Whether the checkpoint changed.
    pub fn advance(&self, position: i64) -> bool {
        self.tx.send_if_modified(|current| {
            if position > *current {
                *current = position;
                true
            } else {
                false
            }
        })
    }

    /// Receiver notified on every advance.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.tx.subscribe()
    }

    /// Advance the checkpoint to every position published on `source`.
    ///
    /// Used by a single-node deployment, where flushing to the local disk is
    /// all the replication there is: `source` is the writer's flushed
    /// position. Returns when `shutdown` fires or `source` closes.
    pub async fn follow(&self, mut source: watch::Receiver<i64>, shutdown: CancellationToken) {
        self.advance(*source.borrow_and_update());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = source.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let position = *source.borrow_and_update();
                    self.advance(position);
                }
            }
        }
        tracing::debug!(checkpoint = self.current(), "replication follower stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let checkpoint = ReplicationCheckpoint::new(10);
        assert!(checkpoint.advance(20));
        assert!(!checkpoint.advance(15));
        assert!(!checkpoint.advance(20));
        assert_eq!(checkpoint.current(), 20);
    }

    #[tokio::test]
    async fn subscribers_see_advances() {
        let checkpoint = ReplicationCheckpoint::new(0);
        let mut rx = checkpoint.subscribe();
        checkpoint.advance(42);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), 42);
    }

    #[tokio::test]
    async fn follow_copies_source_until_shutdown() {
        let checkpoint = ReplicationCheckpoint::new(0);
        let (source_tx, source_rx) = watch::channel(5i64);
        let shutdown = CancellationToken::new();
        let mut observed = checkpoint.subscribe();

        let follower = {
            let checkpoint = checkpoint.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { checkpoint.follow(source_rx, shutdown).await })
        };

        observed
            .wait_for(|p| *p == 5)
            .await
            .expect("initial value copied");
        source_tx.send_replace(90);
        observed
            .wait_for(|p| *p == 90)
            .await
            .expect("advance copied");

        shutdown.cancel();
        follower.await.expect("follower task");
        assert_eq!(checkpoint.current(), 90);
    }
}
