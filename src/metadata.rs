//! Stream metadata carried by `$metadata` events in metadata streams.
//!
//! Only the truncation marker matters to the write path: a stream whose
//! truncate-before equals [`DELETED_STREAM`] is soft-deleted.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::DELETED_STREAM;

/// Parsed content of a `$metadata` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Events numbered below this are hidden from readers.
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
}

impl StreamMetadata {
    /// Metadata that soft-deletes a stream.
    pub fn soft_deleted() -> Self {
        Self {
            truncate_before: Some(DELETED_STREAM),
        }
    }

    /// Metadata that hides every event numbered below `truncate_before`.
    pub fn truncated_before(truncate_before: i64) -> Self {
        Self {
            truncate_before: Some(truncate_before),
        }
    }

    /// Whether this metadata marks the stream as soft-deleted.
    pub fn is_soft_delete(&self) -> bool {
        self.truncate_before == Some(DELETED_STREAM)
    }

    /// Parse a `$metadata` payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Serialize as a `$metadata` payload.
    pub fn to_json(&self) -> Bytes {
        // Serializing a struct with one optional integer field cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec()))
    }
}
