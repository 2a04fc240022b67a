//! Broadcast broker for completed transactions.
//!
//! The `Broker` wraps a `tokio::broadcast` channel that carries
//! `Arc<CommittedTransaction>` messages. The index committer publishes every
//! transaction right after applying it to the index, so a subscriber sees
//! transactions in log order and only once they are visible to readers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::types::LogPosition;

/// Per-stream part of a [`CommittedTransaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedStream {
    /// Stream name.
    pub stream: String,
    /// First event number written, or `last + 1` when nothing was.
    pub first_event_number: i64,
    /// Last event number written.
    pub last_event_number: i64,
    /// Whether the transaction tombstoned the stream.
    pub tombstoned: bool,
}

/// A transaction that has been applied to the lookup index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    /// Location of the transaction in the log.
    pub position: LogPosition,
    /// Streams the transaction wrote, in the order of the original request.
    pub streams: Vec<CommittedStream>,
}

/// Broadcast broker for pushing indexed transactions to subscribers.
///
/// Subscribers that fall more than `capacity` messages behind observe
/// `RecvError::Lagged` and must resynchronize from the read index.
#[derive(Clone, Debug)]
pub struct Broker {
    tx: broadcast::Sender<Arc<CommittedTransaction>>,
}

impl Broker {
    /// Create a new broker with the given broadcast channel capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Messages buffered per subscriber before it lags. Must
    ///   be greater than zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one committed transaction.
    ///
    /// Having no subscribers is normal and not reported.
    pub fn publish(&self, transaction: CommittedTransaction) {
        let _ = self.tx.send(Arc::new(transaction));
    }

    /// Receiver for transactions published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CommittedTransaction>> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
