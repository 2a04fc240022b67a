//! The single log writer.
//!
//! Every append and delete goes through one task, one command at a time, in
//! submission order. For each command the writer runs the consistency checks,
//! combines them into a batch decision, assembles the transaction, writes it
//! to the log and hands it to the index committer. Callers submit commands
//! through a cloneable [`WriterHandle`] over a bounded `tokio::mpsc` channel
//! and get their answer on a oneshot channel, either right away (rejections
//! and replays) or from the committer once the write is indexed.
//!
//! Commands that are already queued when the writer wakes up form a group:
//! each is written on its own, then the group shares one fsync before the
//! writer publishes its checkpoint and acknowledges the group's transactions
//! to the committer.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::committer::{
    CommitterMessage, IndexCommitter, PendingReply, PendingTransaction, ReplySlot, run_committer,
};
use crate::consistency::ConsistencyChecker;
use crate::decision::{BatchDecision, StreamOutcome, aggregate};
use crate::dedup::RecentEvents;
use crate::error::{Error, StorageFault};
use crate::index::StreamIndex;
use crate::log_writer::{LogWriter, WriteOutcome};
use crate::metadata::StreamMetadata;
use crate::metrics::{
    APPENDS_TOTAL, DELETES_TOTAL, LOG_POSITION, SOFT_UNDELETES_TOTAL, TRANSACTIONS_WRITTEN_TOTAL,
    outcome_label,
};
use crate::precommit::{PreCommitCache, StreamLookup, WriterView};
use crate::reader::ReadIndex;
use crate::registry::NameRegistry;
use crate::replication::ReplicationCheckpoint;
use crate::request::{AppendBatch, AppendRequest, validate_stream_name};
use crate::response::AppendResponse;
use crate::soft_delete::{self, WriteTarget};
use crate::store::Store;
use crate::transaction::{AssembledTransaction, TransactionAssembler};
use crate::types::{ExpectedVersion, LogPosition, is_metastream, metastream_of};

/// A unit of work for the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    /// Append a validated batch.
    Append {
        batch: AppendBatch,
        cancel: CancellationToken,
        response_tx: oneshot::Sender<AppendResponse>,
    },
    /// Delete a stream: a tombstone when `hard`, otherwise a soft delete
    /// through the stream's metadata.
    Delete {
        stream: String,
        expected: ExpectedVersion,
        hard: bool,
        cancel: CancellationToken,
        response_tx: oneshot::Sender<AppendResponse>,
    },
}

/// Cloneable handle for submitting commands to the writer task.
///
/// Cloning produces a second sender into the same channel.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
    /// Cancelled once the index committer has exited.
    committer_stopped: CancellationToken,
}

impl WriterHandle {
    /// Create a handle from the sender half of the writer channel.
    pub fn new(tx: mpsc::Sender<WriterCommand>) -> Self {
        Self::with_committer(tx, CancellationToken::new())
    }

    /// Create a handle that also reports the committer exiting, signalled by
    /// `committer_stopped`, as [`Error::ServiceStopped`].
    pub fn with_committer(
        tx: mpsc::Sender<WriterCommand>,
        committer_stopped: CancellationToken,
    ) -> Self {
        Self {
            tx,
            committer_stopped,
        }
    }

    /// Validate `request` and submit it to the writer.
    ///
    /// # Arguments
    ///
    /// * `request` - The append as received from the client.
    /// * `cancel` - Cancelling before the writer starts writing drops the
    ///   request without a reply. Once writing has begun it is ignored.
    ///
    /// # Returns
    ///
    /// `Some(response)` for every answered request, including consistency
    /// failures. `None` when the request was cancelled, or when it replays a
    /// write that is not replicated yet; the client is expected to retry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] or [`Error::EventTooLarge`] if the
    ///   request is malformed. Nothing reaches the writer in that case.
    /// - [`Error::ServiceStopped`] if the writer task is gone.
    pub async fn append(
        &self,
        request: AppendRequest,
        cancel: CancellationToken,
    ) -> Result<Option<AppendResponse>, Error> {
        let batch = request.validate()?;
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(
            WriterCommand::Append {
                batch,
                cancel,
                response_tx,
            },
            response_rx,
            APPENDS_TOTAL,
        )
        .await
    }

    /// Delete `stream`.
    ///
    /// A hard delete tombstones the stream for good and answers with
    /// `DELETED_STREAM` as both event numbers. A soft delete hides the
    /// stream's events until it is written again, and answers with
    /// `first = current + 1`, `last = current`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `stream` is not a valid stream name or
    ///   is a metadata stream.
    /// - [`Error::ServiceStopped`] if the writer task is gone.
    pub async fn delete_stream(
        &self,
        stream: impl Into<String>,
        expected: ExpectedVersion,
        hard: bool,
        cancel: CancellationToken,
    ) -> Result<Option<AppendResponse>, Error> {
        let stream = stream.into();
        validate_stream_name(&stream)?;
        if is_metastream(&stream) {
            return Err(Error::InvalidArgument(format!(
                "metadata stream '{stream}' cannot be deleted"
            )));
        }
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(
            WriterCommand::Delete {
                stream,
                expected,
                hard,
                cancel,
                response_tx,
            },
            response_rx,
            DELETES_TOTAL,
        )
        .await
    }

    async fn submit(
        &self,
        command: WriterCommand,
        response_rx: oneshot::Receiver<AppendResponse>,
        counter: &'static str,
    ) -> Result<Option<AppendResponse>, Error> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::ServiceStopped("writer"))?;

        let response = match response_rx.await {
            Ok(response) => Some(response),
            Err(_) if self.tx.is_closed() => return Err(Error::ServiceStopped("writer")),
            Err(_) if self.committer_stopped.is_cancelled() => {
                return Err(Error::ServiceStopped("index committer"));
            }
            Err(_) => None,
        };
        metrics::counter!(counter, "result" => outcome_label(response.as_ref())).increment(1);
        Ok(response)
    }
}

/// State owned by the writer task.
pub(crate) struct StorageWriter {
    log: LogWriter,
    streams: NameRegistry,
    event_types: NameRegistry,
    index: StreamIndex,
    pending: PreCommitCache,
    recent: RecentEvents,
    replication: watch::Receiver<i64>,
    committer_tx: mpsc::UnboundedSender<CommitterMessage>,
    checkpoint_tx: watch::Sender<i64>,
    /// Written in the current group, not yet flushed.
    unacknowledged: Vec<LogPosition>,
}

impl StorageWriter {
    fn process_group(&mut self, group: Vec<WriterCommand>) -> Result<(), StorageFault> {
        for command in group {
            match command {
                WriterCommand::Append {
                    batch,
                    cancel,
                    response_tx,
                } => self.append(batch, &cancel, response_tx)?,
                WriterCommand::Delete {
                    stream,
                    expected,
                    hard,
                    cancel,
                    response_tx,
                } => self.delete(&stream, expected, hard, &cancel, response_tx)?,
            }
        }
        self.finish_group()
    }

    fn append(
        &mut self,
        batch: AppendBatch,
        cancel: &CancellationToken,
        response_tx: oneshot::Sender<AppendResponse>,
    ) -> Result<(), StorageFault> {
        if cancel.is_cancelled() {
            tracing::debug!(streams = batch.streams().len(), "append cancelled while queued");
            return Ok(());
        }
        self.pending.prune(self.index.indexed_position());

        let replicated = *self.replication.borrow();
        let outcomes: Vec<StreamOutcome> = {
            let view = WriterView::new(&self.index, &self.pending);
            let checker = ConsistencyChecker::new(&view, &self.recent, replicated);
            batch
                .streams()
                .iter()
                .enumerate()
                .map(|(i, stream)| {
                    let is_write_target = batch.is_write_target(i);
                    StreamOutcome {
                        expected: stream.expected,
                        check: checker.check(
                            &stream.name,
                            stream.expected,
                            &batch.event_ids_for(i),
                            is_write_target,
                        ),
                        is_write_target,
                    }
                })
                .collect()
        };

        let decision = aggregate(&outcomes);
        if decision != BatchDecision::Accept {
            answer_without_writing(response_tx, decision);
            return Ok(());
        }

        let current_versions: Vec<i64> = outcomes.iter().map(|o| o.check.current_version).collect();
        let mut transaction = TransactionAssembler::new(&mut self.streams, &mut self.event_types)
            .assemble_batch(&batch, &current_versions);
        if cancel.is_cancelled() {
            self.discard_reservations();
            tracing::debug!("append cancelled before writing");
            return Ok(());
        }

        let Some(position) = self.write_records(&mut transaction)? else {
            send_response(response_tx, AppendResponse::InvalidTransaction);
            return Ok(());
        };
        let slots = reply_slots(&transaction);
        self.hand_off(
            &transaction,
            position,
            Some(PendingReply {
                sender: response_tx,
                slots,
            }),
        )?;

        let targets: Vec<WriteTarget<'_>> = transaction
            .streams
            .iter()
            .zip(&outcomes)
            .map(|(written, outcome)| WriteTarget {
                written,
                was_soft_deleted: outcome.check.is_soft_deleted,
                previous_version: outcome.check.current_version,
            })
            .collect();
        self.undelete(&targets)
    }

    fn delete(
        &mut self,
        stream: &str,
        expected: ExpectedVersion,
        hard: bool,
        cancel: &CancellationToken,
        response_tx: oneshot::Sender<AppendResponse>,
    ) -> Result<(), StorageFault> {
        if cancel.is_cancelled() {
            tracing::debug!(stream, "delete cancelled while queued");
            return Ok(());
        }
        self.pending.prune(self.index.indexed_position());

        let replicated = *self.replication.borrow();
        let (check, metastream_version) = {
            let view = WriterView::new(&self.index, &self.pending);
            let check = ConsistencyChecker::new(&view, &self.recent, replicated)
                .check(stream, expected, &[], true);
            let metastream_version = view.stream_state(&metastream_of(stream)).last_event_number;
            (check, metastream_version)
        };

        let decision = aggregate(&[StreamOutcome {
            expected,
            check,
            is_write_target: true,
        }]);
        if decision != BatchDecision::Accept {
            answer_without_writing(response_tx, decision);
            return Ok(());
        }

        let current = check.current_version;
        let mut assembler = TransactionAssembler::new(&mut self.streams, &mut self.event_types);
        let (mut transaction, slots) = if hard {
            let transaction = assembler.assemble_tombstone(stream, current);
            let slots = reply_slots(&transaction);
            (transaction, slots)
        } else {
            let transaction = assembler.assemble_metadata(
                &metastream_of(stream),
                metastream_version,
                StreamMetadata::soft_deleted(),
            );
            let slots = vec![ReplySlot {
                commit_index: None,
                first_event_number: current.saturating_add(1),
                last_event_number: current,
            }];
            (transaction, slots)
        };
        if cancel.is_cancelled() {
            self.discard_reservations();
            tracing::debug!(stream, "delete cancelled before writing");
            return Ok(());
        }

        let Some(position) = self.write_records(&mut transaction)? else {
            send_response(response_tx, AppendResponse::InvalidTransaction);
            return Ok(());
        };
        tracing::debug!(stream, hard, commit = position.commit, "stream delete written");
        self.hand_off(
            &transaction,
            position,
            Some(PendingReply {
                sender: response_tx,
                slots,
            }),
        )
    }

    /// Append one transaction's records to the log.
    ///
    /// Returns `None`, having written nothing, if the transaction does not fit
    /// in a chunk.
    fn write_records(
        &mut self,
        transaction: &mut AssembledTransaction,
    ) -> Result<Option<LogPosition>, StorageFault> {
        let outcome = self
            .log
            .write(&mut transaction.records)
            .map_err(|e| StorageFault::new("log write", e))?;
        match outcome {
            WriteOutcome::Written { position } => {
                self.streams.confirm_reservations();
                self.event_types.confirm_reservations();
                metrics::counter!(TRANSACTIONS_WRITTEN_TOTAL).increment(1);
                Ok(Some(position))
            }
            WriteOutcome::TooLarge { size, limit } => {
                self.discard_reservations();
                tracing::debug!(size, limit, "transaction does not fit in a chunk");
                Ok(None)
            }
        }
    }

    fn discard_reservations(&mut self) {
        self.streams.discard_reservations();
        self.event_types.discard_reservations();
    }

    /// Record a written transaction everywhere the writer tracks it, then
    /// queue it for indexing.
    fn hand_off(
        &mut self,
        transaction: &AssembledTransaction,
        position: LogPosition,
        reply: Option<PendingReply>,
    ) -> Result<(), StorageFault> {
        for written in &transaction.streams {
            if !written.events.is_empty() {
                self.recent
                    .record(&written.name, written.events.iter().copied());
            }
        }
        let commits = transaction.commits(position);
        self.pending.push(position, commits.clone());
        self.unacknowledged.push(position);
        self.committer_tx
            .send(CommitterMessage::Pending(PendingTransaction {
                position,
                commits,
                reply,
            }))
            .map_err(|_| committer_gone())
    }

    /// Write the truncation markers that undelete soft-deleted streams touched
    /// by the last transaction. Each marker is its own transaction.
    fn undelete(&mut self, targets: &[WriteTarget<'_>]) -> Result<(), StorageFault> {
        let undeletes = soft_delete::resolve(&WriterView::new(&self.index, &self.pending), targets);
        for undelete in undeletes {
            let metastream = metastream_of(&undelete.stream);
            let current = WriterView::new(&self.index, &self.pending)
                .stream_state(&metastream)
                .last_event_number;
            let marker = StreamMetadata::truncated_before(undelete.truncate_before);
            let mut transaction =
                TransactionAssembler::new(&mut self.streams, &mut self.event_types)
                    .assemble_metadata(&metastream, current, marker);
            let Some(position) = self.write_records(&mut transaction)? else {
                tracing::warn!(
                    stream = %undelete.stream,
                    "undelete marker does not fit in a chunk"
                );
                continue;
            };
            self.hand_off(&transaction, position, None)?;
            metrics::counter!(SOFT_UNDELETES_TOTAL).increment(1);
            tracing::debug!(
                stream = %undelete.stream,
                truncate_before = undelete.truncate_before,
                "soft-deleted stream written to, undeleted"
            );
        }
        Ok(())
    }

    /// Flush the group, publish the new checkpoint and acknowledge every
    /// transaction of the group to the committer.
    fn finish_group(&mut self) -> Result<(), StorageFault> {
        let Some(last) = self.unacknowledged.last().copied() else {
            return Ok(());
        };
        self.log
            .flush()
            .map_err(|e| StorageFault::new("log flush", e))?;
        self.checkpoint_tx.send_replace(last.commit);
        metrics::gauge!(LOG_POSITION).set(last.commit as f64);

        for position in self.unacknowledged.drain(..) {
            self.committer_tx
                .send(CommitterMessage::CommitAcknowledged { position })
                .map_err(|_| committer_gone())?;
        }
        Ok(())
    }
}

fn committer_gone() -> StorageFault {
    StorageFault::new("index commit", Error::ServiceStopped("index committer"))
}

/// Provisional numbers for each stream of `transaction`, linked to its
/// commits.
fn reply_slots(transaction: &AssembledTransaction) -> Vec<ReplySlot> {
    let mut next_commit = 0;
    transaction
        .streams
        .iter()
        .map(|written| {
            let commit_index = if written.is_write_target {
                next_commit += 1;
                Some(next_commit - 1)
            } else {
                None
            };
            ReplySlot {
                commit_index,
                first_event_number: written.first_event_number,
                last_event_number: written.last_event_number,
            }
        })
        .collect()
}

/// Answer a batch that will not be written.
fn answer_without_writing(response_tx: oneshot::Sender<AppendResponse>, decision: BatchDecision) {
    let response = match decision {
        BatchDecision::Idempotent {
            first_event_numbers,
            last_event_numbers,
            position,
        } => AppendResponse::Success {
            first_event_numbers,
            last_event_numbers,
            position,
        },
        BatchDecision::WrongExpectedVersion(failures) => {
            AppendResponse::WrongExpectedVersion { failures }
        }
        BatchDecision::StreamDeleted(failure) => AppendResponse::StreamDeleted { failure },
        BatchDecision::NoReply | BatchDecision::Accept => {
            tracing::debug!("replayed write is not replicated yet; leaving request unanswered");
            return;
        }
    };
    send_response(response_tx, response);
}

fn send_response(response_tx: oneshot::Sender<AppendResponse>, response: AppendResponse) {
    if response_tx.send(response).is_err() {
        tracing::debug!("caller went away before its response");
    }
}

/// Run the writer loop.
///
/// Blocks on the first command, then drains whatever else is queued into the
/// same group. Exits when every [`WriterHandle`] is dropped or `shutdown`
/// fires; a group already being processed is finished first.
///
/// # Errors
///
/// Returns a [`StorageFault`] if writing or flushing the log fails, or the
/// committer is gone. The log can no longer be trusted and the service must
/// stop.
pub(crate) async fn run_writer(
    mut writer: StorageWriter,
    mut rx: mpsc::Receiver<WriterCommand>,
    shutdown: CancellationToken,
) -> Result<(), StorageFault> {
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let mut group = vec![first];
        while let Ok(command) = rx.try_recv() {
            group.push(command);
        }

        if let Err(fault) = writer.process_group(group) {
            tracing::error!(error = %fault, "log writer stopped");
            return Err(fault);
        }
    }
    tracing::debug!("log writer stopped");
    Ok(())
}

/// A store whose writer and committer tasks are running.
pub struct RunningStore {
    /// Submits appends and deletes.
    pub writer: WriterHandle,
    /// Reads the committed index.
    pub reader: ReadIndex,
    /// Publishes every indexed transaction.
    pub broker: Broker,
    /// End of the flushed log. Follow it with
    /// [`ReplicationCheckpoint::follow`] on a single node.
    pub writer_checkpoint: watch::Receiver<i64>,
    /// Commit position of the last indexed transaction.
    pub indexed: watch::Receiver<i64>,
    /// Log writer task; an `Err` means the service must stop.
    pub writer_task: JoinHandle<Result<(), StorageFault>>,
    /// Index committer task; an `Err` means the service must stop.
    pub committer_task: JoinHandle<Result<(), StorageFault>>,
}

/// Start the writer and committer tasks for `store`.
///
/// # Arguments
///
/// * `store` - A freshly opened store, moved into the tasks.
/// * `replication` - Checkpoint that gates index visibility.
/// * `shutdown` - Stops both tasks.
pub fn spawn_writer(
    store: Store,
    replication: &ReplicationCheckpoint,
    shutdown: CancellationToken,
) -> RunningStore {
    let Store {
        config,
        log,
        streams,
        event_types,
        index,
        recent,
        unindexed,
    } = store;

    let mut pending = PreCommitCache::new();
    let recovered = unindexed
        .into_iter()
        .map(|(position, commits)| {
            pending.push(position, commits.clone());
            PendingTransaction {
                position,
                commits,
                reply: None,
            }
        })
        .collect();

    let broker = Broker::new(config.broker_capacity);
    let (indexed_tx, indexed) = watch::channel(index.indexed_position());
    let (checkpoint_tx, writer_checkpoint) = watch::channel(log.write_position());
    let (committer_tx, committer_rx) = mpsc::unbounded_channel();
    let (tx, rx) = mpsc::channel(config.writer_queue);

    let committer = IndexCommitter::new(index.clone(), broker.clone(), indexed_tx, recovered);
    let committer_stopped = CancellationToken::new();
    let committer_task = tokio::spawn(run_committer(
        committer,
        committer_rx,
        replication.subscribe(),
        shutdown.clone(),
        committer_stopped.clone(),
    ));

    let writer = StorageWriter {
        log,
        streams,
        event_types,
        index: index.clone(),
        pending,
        recent,
        replication: replication.subscribe(),
        committer_tx,
        checkpoint_tx,
        unacknowledged: Vec::new(),
    };
    let writer_task = tokio::spawn(run_writer(writer, rx, shutdown));

    RunningStore {
        writer: WriterHandle::with_committer(tx, committer_stopped),
        reader: ReadIndex::new(index),
        broker,
        writer_checkpoint,
        indexed,
        writer_task,
        committer_task,
    }
}
