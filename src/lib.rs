//! StrandDB: an append-only event store with atomic multi-stream appends.
//!
//! One append request may write events to several streams at once, each
//! guarded by its own expected-version precondition. The whole batch becomes
//! a single transaction in the log: either every stream advances or none does.
//!
//! The pipeline, in the order a request travels through it:
//!
//! - [`request`] validates the request into an [`AppendBatch`].
//! - [`consistency`] checks each stream's precondition and spots replays.
//! - [`decision`] folds the per-stream checks into one outcome.
//! - [`transaction`] lays the batch out as log records.
//! - [`log_writer`] and [`chunk`] append the records to the chunked log.
//! - [`soft_delete`] undeletes soft-deleted streams that were written to.
//! - [`committer`] applies replicated transactions to the [`index`] and
//!   answers the caller.
//!
//! [`writer`] runs the single writer task that drives the first six steps;
//! [`store`] opens and recovers a store.

pub mod broker;
pub mod chunk;
pub mod codec;
pub mod committer;
pub mod consistency;
pub mod decision;
pub mod dedup;
pub mod error;
pub mod index;
pub mod log_writer;
pub mod metadata;
pub mod metrics;
pub mod precommit;
pub mod reader;
pub mod registry;
pub mod replication;
pub mod request;
pub mod response;
pub mod soft_delete;
pub mod store;
pub mod transaction;
pub mod types;
pub mod writer;

pub use broker::{Broker, CommittedStream, CommittedTransaction};
pub use error::{Error, StorageFault};
pub use reader::ReadIndex;
pub use replication::ReplicationCheckpoint;
pub use request::{AppendBatch, AppendRequest};
pub use response::{AppendResponse, ConsistencyCheckFailure, SingleStreamResponse};
pub use store::{Store, StoreConfig};
pub use types::{
    DELETED_STREAM, ExpectedVersion, LogPosition, MAX_EVENT_SIZE, NO_STREAM, ProposedEvent,
    StreamState,
};
pub use writer::{RunningStore, WriterHandle, spawn_writer};
