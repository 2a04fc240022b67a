//! Core domain types for StrandDB.
//!
//! This module defines the foundational data types that every other module depends on:
//! proposed events (client-submitted), expected version semantics for optimistic
//! concurrency, log positions, the observable state of a stream, and size limit
//! constants.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// Maximum size of a single event in bytes (event type + metadata + payload).
pub const MAX_EVENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of an event type tag in bytes.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

/// Maximum length of a stream name in bytes.
pub const MAX_STREAM_NAME_LEN: usize = 1024;

/// Current version of a stream that has never been written.
pub const NO_STREAM: i64 = -1;

/// Current version of a tombstoned stream.
pub const DELETED_STREAM: i64 = i64::MAX;

/// Prefix that turns a stream name into the name of its metadata stream.
pub const METASTREAM_PREFIX: &str = "$$";

/// Event type of metadata events written to metadata streams.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Event type of the tombstone written by a hard delete.
pub const TOMBSTONE_EVENT_TYPE: &str = "$streamDeleted";

/// An event the client wants to append.
///
/// The client assigns the `event_id`. It is the identity used to detect
/// retried writes, so a retry must reuse the ids of the original attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Client-assigned unique ID for this event.
    pub event_id: Uuid,
    /// Event type tag (UTF-8, max 256 bytes).
    pub event_type: String,
    /// Whether `payload` is JSON.
    pub is_json: bool,
    /// Opaque infrastructure context (correlation ID, causation ID, etc.).
    pub metadata: Bytes,
    /// Opaque domain event body.
    pub payload: Bytes,
}

impl ProposedEvent {
    /// Bytes counted against [`MAX_EVENT_SIZE`].
    pub fn size(&self) -> usize {
        self.event_type.len() + self.metadata.len() + self.payload.len()
    }
}

/// Precondition on the state of one stream.
///
/// # Variants
///
/// * `Any` - No check.
/// * `NoStream` - Stream must not exist. A soft-deleted stream counts as not existing.
/// * `StreamExists` - Stream must have at least one live event.
/// * `DeletedStream` - Stream must be tombstoned. Only valid for check-only streams.
/// * `Exact(n)` - Stream's last event number must be exactly `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    StreamExists,
    DeletedStream,
    Exact(u64),
}

impl ExpectedVersion {
    /// Raw value of [`ExpectedVersion::Any`].
    pub const RAW_ANY: i64 = -2;
    /// Raw value of [`ExpectedVersion::NoStream`].
    pub const RAW_NO_STREAM: i64 = -1;
    /// Raw value of [`ExpectedVersion::StreamExists`].
    pub const RAW_STREAM_EXISTS: i64 = -4;
    /// Raw value of [`ExpectedVersion::DeletedStream`].
    pub const RAW_DELETED_STREAM: i64 = DELETED_STREAM;

    /// Decode a raw precondition as carried by the transport layer.
    ///
    /// Returns `None` for values outside the recognized sentinels and the
    /// non-negative range.
    pub fn from_raw(raw: i64) -> Option<ExpectedVersion> {
        match raw {
            Self::RAW_ANY => Some(ExpectedVersion::Any),
            Self::RAW_NO_STREAM => Some(ExpectedVersion::NoStream),
            Self::RAW_STREAM_EXISTS => Some(ExpectedVersion::StreamExists),
            Self::RAW_DELETED_STREAM => Some(ExpectedVersion::DeletedStream),
            n if n >= 0 => Some(ExpectedVersion::Exact(n as u64)),
            _ => None,
        }
    }

    /// Encode as the raw transport value.
    pub fn raw(self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::RAW_ANY,
            ExpectedVersion::NoStream => Self::RAW_NO_STREAM,
            ExpectedVersion::StreamExists => Self::RAW_STREAM_EXISTS,
            ExpectedVersion::DeletedStream => Self::RAW_DELETED_STREAM,
            ExpectedVersion::Exact(n) => n as i64,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("Any"),
            ExpectedVersion::NoStream => f.write_str("NoStream"),
            ExpectedVersion::StreamExists => f.write_str("StreamExists"),
            ExpectedVersion::DeletedStream => f.write_str("DeletedStream"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

/// Location of a transaction in the log.
///
/// `prepare` is the position of the transaction's first record. `commit` is
/// the position just past its last record; a transaction is replicated once
/// the replication checkpoint reaches `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LogPosition {
    pub commit: i64,
    pub prepare: i64,
}

/// Identity and location of one written event, as known to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedEvent {
    /// Zero-based event number within the stream.
    pub event_number: i64,
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Transaction that wrote the event.
    pub position: LogPosition,
}

/// Current state of a stream as seen by consistency checks and readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    /// Number of the last event written, or [`NO_STREAM`].
    pub last_event_number: i64,
    /// Whether the stream was hard-deleted.
    pub tombstoned: bool,
    /// Whether the stream's metadata marks it as soft-deleted.
    pub soft_deleted: bool,
}

impl StreamState {
    /// State of a stream that was never written and has no metadata.
    pub const ABSENT: StreamState = StreamState {
        last_event_number: NO_STREAM,
        tombstoned: false,
        soft_deleted: false,
    };

    /// Version reported in responses: [`DELETED_STREAM`] when tombstoned,
    /// otherwise the last event number.
    pub fn current_version(&self) -> i64 {
        if self.tombstoned {
            DELETED_STREAM
        } else {
            self.last_event_number
        }
    }

    /// Whether the stream has at least one event that is not hidden by a delete.
    pub fn is_live(&self) -> bool {
        !self.tombstoned && !self.soft_deleted && self.last_event_number > NO_STREAM
    }
}

/// Summary of one stream returned by `ReadIndex::list_streams`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream name.
    pub stream: String,
    /// Committed state of the stream.
    pub state: StreamState,
}

/// Whether `stream` is a metadata stream.
pub fn is_metastream(stream: &str) -> bool {
    stream.starts_with(METASTREAM_PREFIX)
}

/// Name of the metadata stream belonging to `stream`.
pub fn metastream_of(stream: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream}")
}

/// Name of the data stream a metadata stream describes, or `None` if
/// `stream` is not a metadata stream.
pub fn original_stream_of(stream: &str) -> Option<&str> {
    stream.strip_prefix(METASTREAM_PREFIX)
}
