//! The index committer: makes written transactions visible to readers.
//!
//! The log writer hands every transaction it writes to the committer as a
//! [`CommitterMessage::Pending`], and after the group's fsync it sends a
//! [`CommitterMessage::CommitAcknowledged`] for each. A transaction is applied
//! to the [`StreamIndex`] once it is acknowledged and its commit position is
//! at or below the replication checkpoint. Transactions are applied strictly
//! in log order: a later transaction never overtakes an earlier one.
//!
//! The committer owns its pending map outright. Nothing else touches it; the
//! writer only sends messages.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, CommittedStream, CommittedTransaction};
use crate::error::{Error, StorageFault};
use crate::index::{IndexState, StreamCommit, StreamIndex};
use crate::metrics::{INDEX_COMMITS_TOTAL, TRANSACTIONS_PENDING};
use crate::response::AppendResponse;
use crate::types::{DELETED_STREAM, LogPosition};

/// Numbers reported for one stream of the request being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplySlot {
    /// Index into the transaction's commits, for streams that received
    /// records. The committed numbers replace the provisional ones below.
    pub commit_index: Option<usize>,
    /// Provisional first event number assigned by the writer.
    pub first_event_number: i64,
    /// Provisional last event number assigned by the writer.
    pub last_event_number: i64,
}

/// A caller waiting for its transaction to be indexed.
#[derive(Debug)]
pub struct PendingReply {
    pub sender: oneshot::Sender<AppendResponse>,
    /// One slot per stream of the request, in request order.
    pub slots: Vec<ReplySlot>,
}

/// A transaction in the log that the index has not seen yet.
#[derive(Debug)]
pub struct PendingTransaction {
    pub position: LogPosition,
    pub commits: Vec<StreamCommit>,
    /// `None` for transactions nobody waits on: soft-undelete follow-ups and
    /// transactions recovered at startup.
    pub reply: Option<PendingReply>,
}

/// Input to [`run_committer`].
#[derive(Debug)]
pub enum CommitterMessage {
    /// A transaction was written to the log.
    Pending(PendingTransaction),
    /// The transaction at `position` is flushed to disk.
    CommitAcknowledged { position: LogPosition },
}

/// State owned by the committer task.
pub struct IndexCommitter {
    index: StreamIndex,
    broker: Broker,
    indexed_tx: watch::Sender<i64>,
    /// Keyed by prepare position.
    pending: BTreeMap<i64, PendingTransaction>,
    /// Acknowledged positions, keyed by prepare position.
    acknowledged: BTreeMap<i64, LogPosition>,
}

impl IndexCommitter {
    /// Create a committer.
    ///
    /// # Arguments
    ///
    /// * `index` - Index to apply transactions to. The committer is its only
    ///   writer.
    /// * `broker` - Receives every applied transaction.
    /// * `indexed_tx` - Publishes the indexed position after each apply.
    /// * `recovered` - Transactions found in the log at startup beyond the
    ///   replication checkpoint. They are durable already, so they count as
    ///   acknowledged.
    pub fn new(
        index: StreamIndex,
        broker: Broker,
        indexed_tx: watch::Sender<i64>,
        recovered: Vec<PendingTransaction>,
    ) -> Self {
        let mut committer = Self {
            index,
            broker,
            indexed_tx,
            pending: BTreeMap::new(),
            acknowledged: BTreeMap::new(),
        };
        for transaction in recovered {
            committer
                .acknowledged
                .insert(transaction.position.prepare, transaction.position);
            committer.accept(CommitterMessage::Pending(transaction));
        }
        committer
    }

    /// Buffer one message. Nothing is applied until [`drain`](Self::drain).
    pub fn accept(&mut self, message: CommitterMessage) {
        match message {
            CommitterMessage::Pending(transaction) => {
                self.pending.insert(transaction.position.prepare, transaction);
            }
            CommitterMessage::CommitAcknowledged { position } => {
                self.acknowledged.insert(position.prepare, position);
            }
        }
        metrics::gauge!(TRANSACTIONS_PENDING).set(self.pending.len() as f64);
    }

    /// Number of transactions not yet applied.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply every eligible transaction, oldest first.
    ///
    /// Stops at the first transaction that is unacknowledged or beyond
    /// `replicated`.
    ///
    /// # Returns
    ///
    /// The number of transactions applied.
    ///
    /// # Errors
    ///
    /// - [`Error::PositionMismatch`] if an acknowledgement disagrees with the
    ///   transaction it names, or the index refuses the transaction's position.
    /// - [`Error::IndexDivergence`] if the index refuses the transaction's
    ///   effects.
    ///
    /// Either way the index no longer matches the log and the committer must
    /// stop.
    pub fn drain(&mut self, replicated: i64) -> Result<usize, Error> {
        let mut applied = 0;
        loop {
            let Some((&prepare, transaction)) = self.pending.first_key_value() else {
                break;
            };
            let Some(&acknowledged) = self.acknowledged.get(&prepare) else {
                break;
            };
            if acknowledged != transaction.position {
                return Err(Error::PositionMismatch {
                    expected: transaction.position.commit,
                    actual: acknowledged.commit,
                });
            }
            if transaction.position.commit > replicated {
                break;
            }

            self.acknowledged.remove(&prepare);
            let Some((_, transaction)) = self.pending.pop_first() else {
                break;
            };
            self.apply(transaction)?;
            applied += 1;
        }
        if applied > 0 {
            metrics::gauge!(TRANSACTIONS_PENDING).set(self.pending.len() as f64);
        }
        Ok(applied)
    }

    fn apply(&mut self, transaction: PendingTransaction) -> Result<(), Error> {
        let PendingTransaction {
            position,
            commits,
            reply,
        } = transaction;

        self.index.apply_transaction(&commits, position)?;
        let streams = self
            .index
            .with_state(|state| committed_streams(state, &commits));
        self.indexed_tx.send_replace(position.commit);
        metrics::counter!(INDEX_COMMITS_TOTAL).increment(1);
        tracing::trace!(
            prepare = position.prepare,
            commit = position.commit,
            streams = commits.len(),
            "transaction indexed"
        );

        if let Some(reply) = reply {
            let (first_event_numbers, last_event_numbers): (Vec<i64>, Vec<i64>) = reply
                .slots
                .iter()
                .map(|slot| match slot.commit_index.and_then(|i| streams.get(i)) {
                    Some(committed) => (committed.first_event_number, committed.last_event_number),
                    None => (slot.first_event_number, slot.last_event_number),
                })
                .unzip();
            let response = AppendResponse::Success {
                first_event_numbers,
                last_event_numbers,
                position,
            };
            if reply.sender.send(response).is_err() {
                tracing::debug!(
                    commit = position.commit,
                    "caller went away before its write was indexed"
                );
            }
        }

        self.broker.publish(CommittedTransaction { position, streams });
        Ok(())
    }
}

/// Final numbers of each commit, read back from the index right after the
/// commit was applied.
fn committed_streams(state: &IndexState, commits: &[StreamCommit]) -> Vec<CommittedStream> {
    commits
        .iter()
        .map(|commit| {
            let (first_event_number, last_event_number) = if commit.tombstone {
                (DELETED_STREAM, DELETED_STREAM)
            } else {
                match (commit.events.first(), commit.events.last()) {
                    (Some(first), Some(last)) => (first.event_number, last.event_number),
                    _ => {
                        let current = state.stream_state(&commit.stream).last_event_number;
                        (current.saturating_add(1), current)
                    }
                }
            };
            CommittedStream {
                stream: commit.stream.clone(),
                first_event_number,
                last_event_number,
                tombstoned: commit.tombstone,
            }
        })
        .collect()
}

/// Run the committer until shutdown.
///
/// Wakes on every message from the writer and on every replication
/// checkpoint advance, and drains whatever became eligible. Once the writer
/// is gone the loop keeps going until nothing is pending or the replication
/// checkpoint can no longer move.
///
/// `stopped` is cancelled when the committer exits for any reason, before
/// the replies it still holds are dropped.
///
/// # Errors
///
/// Returns a [`StorageFault`] if applying a transaction fails. The index is
/// then behind the log and the service must stop.
pub async fn run_committer(
    mut committer: IndexCommitter,
    mut rx: mpsc::UnboundedReceiver<CommitterMessage>,
    mut replication: watch::Receiver<i64>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
) -> Result<(), StorageFault> {
    // Locals drop before parameters, so this fires ahead of the pending replies.
    let _stopped = stopped.drop_guard();
    let mut writer_open = true;
    let mut replication_open = true;

    loop {
        let replicated = *replication.borrow_and_update();
        if let Err(e) = committer.drain(replicated) {
            let fault = StorageFault::new("index commit", e);
            tracing::error!(error = %fault, "index committer stopped");
            return Err(fault);
        }
        if !writer_open && (committer.pending_len() == 0 || !replication_open) {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv(), if writer_open => match message {
                Some(message) => {
                    committer.accept(message);
                    while let Ok(message) = rx.try_recv() {
                        committer.accept(message);
                    }
                }
                None => writer_open = false,
            },
            changed = replication.changed(), if replication_open => {
                if changed.is_err() {
                    replication_open = false;
                }
            }
        }
    }

    if committer.pending_len() > 0 {
        tracing::info!(
            pending = committer.pending_len(),
            "index committer stopping with unindexed transactions"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    use crate::types::IndexedEvent;

    fn pos(prepare: i64, commit: i64) -> LogPosition {
        LogPosition { commit, prepare }
    }

    fn transaction(
        stream: &str,
        from: i64,
        count: i64,
        position: LogPosition,
        reply: Option<PendingReply>,
    ) -> PendingTransaction {
        let events = (from..from + count)
            .map(|event_number| IndexedEvent {
                event_number,
                event_id: Uuid::new_v4(),
                position,
            })
            .collect();
        PendingTransaction {
            position,
            commits: vec![StreamCommit::events(stream, events)],
            reply,
        }
    }

    fn committer(index: &StreamIndex, broker: &Broker) -> (IndexCommitter, watch::Receiver<i64>) {
        let (indexed_tx, indexed_rx) = watch::channel(0);
        (
            IndexCommitter::new(index.clone(), broker.clone(), indexed_tx, Vec::new()),
            indexed_rx,
        )
    }

    #[test]
    fn nothing_is_applied_before_replication() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (mut committer, _indexed) = committer(&index, &broker);
        let p = pos(0, 40);
        committer.accept(CommitterMessage::Pending(transaction("a", 0, 1, p, None)));
        committer.accept(CommitterMessage::CommitAcknowledged { position: p });

        assert_eq!(committer.drain(39).expect("drain"), 0);
        assert_eq!(index.stream_state("a").last_event_number, -1);

        assert_eq!(committer.drain(40).expect("drain"), 1);
        assert_eq!(index.stream_state("a").last_event_number, 0);
        assert_eq!(committer.pending_len(), 0);
    }

    #[test]
    fn unacknowledged_transaction_blocks_later_ones() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (mut committer, _indexed) = committer(&index, &broker);
        let p1 = pos(0, 40);
        let p2 = pos(40, 80);
        committer.accept(CommitterMessage::Pending(transaction("a", 0, 1, p1, None)));
        committer.accept(CommitterMessage::Pending(transaction("b", 0, 1, p2, None)));
        committer.accept(CommitterMessage::CommitAcknowledged { position: p2 });

        assert_eq!(committer.drain(100).expect("drain"), 0);
        assert_eq!(index.stream_state("b").last_event_number, -1);

        committer.accept(CommitterMessage::CommitAcknowledged { position: p1 });
        assert_eq!(committer.drain(100).expect("drain"), 2);
        assert_eq!(index.indexed_position(), 80);
    }

    #[test]
    fn acknowledgement_before_pending_is_buffered() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (mut committer, indexed) = committer(&index, &broker);
        let p = pos(0, 40);
        committer.accept(CommitterMessage::CommitAcknowledged { position: p });
        assert_eq!(committer.drain(40).expect("drain"), 0);

        committer.accept(CommitterMessage::Pending(transaction("a", 0, 2, p, None)));
        assert_eq!(committer.drain(40).expect("drain"), 1);
        assert_eq!(*indexed.borrow(), 40);
    }

    #[test]
    fn reply_carries_committed_numbers_and_check_only_slots() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let mut completions = broker.subscribe();
        let (mut committer, _indexed) = committer(&index, &broker);
        let (sender, mut receiver) = oneshot::channel();
        let p = pos(0, 60);
        let reply = PendingReply {
            sender,
            slots: vec![
                ReplySlot {
                    commit_index: Some(0),
                    first_event_number: 0,
                    last_event_number: 2,
                },
                ReplySlot {
                    commit_index: None,
                    first_event_number: 5,
                    last_event_number: 4,
                },
            ],
        };
        committer.accept(CommitterMessage::Pending(transaction("a", 0, 3, p, Some(reply))));
        committer.accept(CommitterMessage::CommitAcknowledged { position: p });
        committer.drain(60).expect("drain");

        let response = receiver.try_recv().expect("reply sent");
        assert_eq!(
            response,
            AppendResponse::Success {
                first_event_numbers: vec![0, 5],
                last_event_numbers: vec![2, 4],
                position: p,
            }
        );
        let completed = completions.try_recv().expect("broadcast");
        assert_eq!(completed.position, p);
        assert_eq!(completed.streams[0].last_event_number, 2);
    }

    #[test]
    fn mismatched_acknowledgement_is_a_fault() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (mut committer, _indexed) = committer(&index, &broker);
        committer.accept(CommitterMessage::Pending(transaction("a", 0, 1, pos(0, 40), None)));
        committer.accept(CommitterMessage::CommitAcknowledged {
            position: pos(0, 44),
        });
        assert!(matches!(
            committer.drain(100),
            Err(Error::PositionMismatch {
                expected: 40,
                actual: 44
            })
        ));
    }

    #[test]
    fn diverging_transaction_is_an_error() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (mut committer, _indexed) = committer(&index, &broker);
        let p = pos(0, 40);
        committer.accept(CommitterMessage::Pending(transaction("a", 3, 1, p, None)));
        committer.accept(CommitterMessage::CommitAcknowledged { position: p });
        assert!(matches!(
            committer.drain(40),
            Err(Error::IndexDivergence { .. })
        ));
    }

    #[test]
    fn recovered_transactions_only_wait_for_replication() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (indexed_tx, _indexed_rx) = watch::channel(0);
        let recovered = vec![
            transaction("a", 0, 1, pos(0, 40), None),
            transaction("a", 1, 1, pos(40, 80), None),
        ];
        let mut committer = IndexCommitter::new(index.clone(), broker, indexed_tx, recovered);
        assert_eq!(committer.drain(40).expect("drain"), 1);
        assert_eq!(committer.drain(80).expect("drain"), 1);
        assert_eq!(index.stream_state("a").last_event_number, 1);
    }

    #[tokio::test]
    async fn task_applies_when_checkpoint_advances() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (committer, mut indexed) = committer(&index, &broker);
        let (tx, rx) = mpsc::unbounded_channel();
        let (replication_tx, replication_rx) = watch::channel(0i64);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_committer(
            committer,
            rx,
            replication_rx,
            shutdown.clone(),
            CancellationToken::new(),
        ));

        let p = pos(0, 40);
        tx.send(CommitterMessage::Pending(transaction("a", 0, 1, p, None)))
            .expect("send");
        tx.send(CommitterMessage::CommitAcknowledged { position: p })
            .expect("send");
        replication_tx.send_replace(40);

        indexed.wait_for(|p| *p == 40).await.expect("indexed");
        assert_eq!(index.stream_state("a").last_event_number, 0);

        shutdown.cancel();
        task.await.expect("join").expect("no fault");
    }

    #[tokio::test]
    async fn task_reports_fault() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (committer, _indexed) = committer(&index, &broker);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_replication_tx, replication_rx) = watch::channel(100i64);
        let stopped = CancellationToken::new();
        let task = tokio::spawn(run_committer(
            committer,
            rx,
            replication_rx,
            CancellationToken::new(),
            stopped.clone(),
        ));

        let p = pos(0, 40);
        tx.send(CommitterMessage::Pending(transaction("a", 7, 1, p, None)))
            .expect("send");
        tx.send(CommitterMessage::CommitAcknowledged { position: p })
            .expect("send");

        let fault = task.await.expect("join").expect_err("fault");
        assert_eq!(fault.stage, "index commit");
        assert!(stopped.is_cancelled());
    }

    #[tokio::test]
    async fn stopped_fires_before_waiting_replies_are_dropped() {
        let index = StreamIndex::new();
        let broker = Broker::new(8);
        let (committer, _indexed) = committer(&index, &broker);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_replication_tx, replication_rx) = watch::channel(0i64);
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();
        let task = tokio::spawn(run_committer(
            committer,
            rx,
            replication_rx,
            shutdown.clone(),
            stopped.clone(),
        ));

        let (sender, receiver) = oneshot::channel();
        let reply = PendingReply {
            sender,
            slots: Vec::new(),
        };
        tx.send(CommitterMessage::Pending(transaction("a", 0, 1, pos(0, 40), Some(reply))))
            .expect("send");
        assert!(!stopped.is_cancelled());
        shutdown.cancel();

        assert!(receiver.await.is_err(), "reply must be dropped unanswered");
        assert!(stopped.is_cancelled());
        task.await.expect("join").expect("no fault");
    }
}
