//! Undeleting soft-deleted streams after a write.
//!
//! Writing to a soft-deleted stream brings it back: its truncation marker is
//! moved past the events that existed at deletion time, so only the new
//! events are visible. The same happens to a soft-deleted stream whose
//! metadata stream is written without re-deleting it. The marker update is a
//! separate transaction appended after the triggering one.

use crate::precommit::StreamLookup;
use crate::transaction::WrittenStream;
use crate::types::original_stream_of;

/// One stream written by a transaction, with its state before the write.
#[derive(Debug, Clone, Copy)]
pub struct WriteTarget<'a> {
    /// Effects of the transaction on the stream.
    pub written: &'a WrittenStream,
    /// Whether the stream was soft-deleted before the write.
    pub was_soft_deleted: bool,
    /// Current version of the stream before the write.
    pub previous_version: i64,
}

/// A truncation marker to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Undelete {
    /// Data stream to undelete.
    pub stream: String,
    /// New truncate-before value.
    pub truncate_before: i64,
}

/// Decide which streams a completed write undeletes.
///
/// # Arguments
///
/// * `lookup` - Stream state including the write that just happened.
/// * `targets` - Streams of the write, in request order. Check-only streams
///   are skipped.
pub fn resolve(lookup: &impl StreamLookup, targets: &[WriteTarget<'_>]) -> Vec<Undelete> {
    let mut undeletes: Vec<Undelete> = Vec::new();
    let mut push = |undelete: Undelete| {
        if !undeletes.iter().any(|u| u.stream == undelete.stream) {
            undeletes.push(undelete);
        }
    };

    for target in targets {
        let written = target.written;
        if !written.is_write_target {
            continue;
        }

        if target.was_soft_deleted && lookup.stream_state(&written.name).soft_deleted {
            push(Undelete {
                stream: written.name.clone(),
                truncate_before: target.previous_version.saturating_add(1),
            });
        }

        if let Some(original) = original_stream_of(&written.name) {
            if written.metadata.is_some_and(|m| m.is_soft_delete()) {
                continue;
            }
            let state = lookup.stream_state(original);
            if state.soft_deleted && !state.tombstoned {
                push(Undelete {
                    stream: original.to_string(),
                    truncate_before: state.last_event_number.saturating_add(1),
                });
            }
        }
    }
    undeletes
}
