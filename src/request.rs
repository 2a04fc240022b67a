//! Append requests and their static validation.
//!
//! An [`AppendRequest`] is what the transport layer hands over: raw stream
//! names, raw precondition integers, events, and an event-to-stream index map.
//! [`AppendRequest::validate`] turns it into an [`AppendBatch`] or rejects it
//! as malformed. Validation never touches storage.

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::Error;
use crate::types::{
    ExpectedVersion, MAX_EVENT_SIZE, MAX_EVENT_TYPE_LEN, MAX_STREAM_NAME_LEN, METASTREAM_PREFIX,
    ProposedEvent,
};

/// An append request as received from a client.
///
/// # Fields
///
/// * `stream_names` - Destination streams, in the order responses report them.
/// * `expected_versions` - One raw precondition per stream.
/// * `events` - Events to append, in log order.
/// * `event_stream_indexes` - For each event, the index of its stream in
///   `stream_names`. Ignored when only one stream is named.
#[derive(Debug, Clone, Default)]
pub struct AppendRequest {
    pub stream_names: Vec<String>,
    pub expected_versions: Vec<i64>,
    pub events: Vec<ProposedEvent>,
    pub event_stream_indexes: Vec<i32>,
}

impl AppendRequest {
    /// Build a request that writes `events` to a single stream.
    pub fn single_stream(
        stream: impl Into<String>,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Self {
        Self {
            stream_names: vec![stream.into()],
            expected_versions: vec![expected.raw()],
            events,
            event_stream_indexes: Vec::new(),
        }
    }

    /// Validate the request and normalize it into an [`AppendBatch`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the request is structurally malformed:
    ///   mismatched list lengths, an invalid or duplicate stream name, an
    ///   unrecognized precondition, a bad index map, a multi-stream request
    ///   with no events, `DeletedStream` on a stream that would be written,
    ///   or an invalid event type.
    /// - [`Error::EventTooLarge`] if any event exceeds [`MAX_EVENT_SIZE`].
    pub fn validate(self) -> Result<AppendBatch, Error> {
        let AppendRequest {
            stream_names,
            expected_versions,
            events,
            event_stream_indexes,
        } = self;

        if stream_names.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one stream name is required".into(),
            ));
        }
        if stream_names.len() != expected_versions.len() {
            return Err(Error::InvalidArgument(format!(
                "{} stream names but {} expected versions",
                stream_names.len(),
                expected_versions.len()
            )));
        }

        let mut seen = HashSet::with_capacity(stream_names.len());
        for name in &stream_names {
            validate_stream_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "stream '{name}' is named more than once"
                )));
            }
        }

        let mut expected = Vec::with_capacity(expected_versions.len());
        for (i, raw) in expected_versions.iter().enumerate() {
            let version = ExpectedVersion::from_raw(*raw).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "expected version {raw} for stream index {i} is not recognized"
                ))
            })?;
            expected.push(version);
        }

        for event in &events {
            validate_event(event)?;
        }

        let single = stream_names.len() == 1;
        let event_streams = if single {
            vec![0; events.len()]
        } else {
            route_events(stream_names.len(), events.len(), &event_stream_indexes)?
        };

        let mut event_counts = vec![0usize; stream_names.len()];
        for &s in &event_streams {
            event_counts[s] += 1;
        }

        let streams: Vec<BatchStream> = stream_names
            .into_iter()
            .zip(expected)
            .zip(event_counts)
            .map(|((name, expected), event_count)| BatchStream {
                name,
                expected,
                event_count,
            })
            .collect();

        for (i, stream) in streams.iter().enumerate() {
            let writes = single || stream.event_count > 0;
            if writes && stream.expected == ExpectedVersion::DeletedStream {
                return Err(Error::InvalidArgument(format!(
                    "stream index {i} expects a deleted stream but is written to"
                )));
            }
        }

        Ok(AppendBatch {
            streams,
            events,
            event_streams,
        })
    }
}

pub(crate) fn validate_stream_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("stream name is empty".into()));
    }
    if name == METASTREAM_PREFIX {
        return Err(Error::InvalidArgument(format!(
            "'{METASTREAM_PREFIX}' is not a valid stream name"
        )));
    }
    if name.len() > MAX_STREAM_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "stream name is {} bytes, limit is {MAX_STREAM_NAME_LEN}",
            name.len()
        )));
    }
    Ok(())
}

fn validate_event(event: &ProposedEvent) -> Result<(), Error> {
    if event.event_type.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "event {} has an empty event type",
            event.event_id
        )));
    }
    if event.event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(Error::InvalidArgument(format!(
            "event type is {} bytes, limit is {MAX_EVENT_TYPE_LEN}",
            event.event_type.len()
        )));
    }
    let size = event.size();
    if size > MAX_EVENT_SIZE {
        return Err(Error::EventTooLarge {
            size,
            max: MAX_EVENT_SIZE,
        });
    }
    Ok(())
}

/// Check the index map of a multi-stream request.
///
/// Streams must receive their first event in the order they are listed, so
/// every stream that has events precedes every check-only stream.
fn route_events(
    stream_count: usize,
    event_count: usize,
    indexes: &[i32],
) -> Result<Vec<usize>, Error> {
    if event_count == 0 {
        return Err(Error::InvalidArgument(
            "a multi-stream append needs at least one event".into(),
        ));
    }
    if indexes.len() != event_count {
        return Err(Error::InvalidArgument(format!(
            "{event_count} events but {} event stream indexes",
            indexes.len()
        )));
    }

    let mut routed = Vec::with_capacity(event_count);
    let mut next_new = 0usize;
    for (i, &raw) in indexes.iter().enumerate() {
        let index = usize::try_from(raw)
            .ok()
            .filter(|index| *index < stream_count)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "event {i} targets stream index {raw}, only {stream_count} streams named"
                ))
            })?;
        if index > next_new {
            return Err(Error::InvalidArgument(format!(
                "event {i} targets stream index {index} before stream index {next_new} was used"
            )));
        }
        if index == next_new {
            next_new += 1;
        }
        routed.push(index);
    }
    Ok(routed)
}

/// One destination stream of a validated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStream {
    /// Stream name.
    pub name: String,
    /// Precondition on the stream.
    pub expected: ExpectedVersion,
    /// Number of events routed to the stream.
    pub event_count: usize,
}

/// A validated append request: the unit of atomicity.
#[derive(Debug, Clone)]
pub struct AppendBatch {
    streams: Vec<BatchStream>,
    events: Vec<ProposedEvent>,
    /// Stream index of each event.
    event_streams: Vec<usize>,
}

impl AppendBatch {
    /// Destination streams in request order.
    pub fn streams(&self) -> &[BatchStream] {
        &self.streams
    }

    /// Events in log order.
    pub fn events(&self) -> &[ProposedEvent] {
        &self.events
    }

    /// Stream index of the event at `event_index`.
    pub fn stream_of_event(&self, event_index: usize) -> usize {
        self.event_streams[event_index]
    }

    /// Whether exactly one stream was named.
    pub fn is_single_stream(&self) -> bool {
        self.streams.len() == 1
    }

    /// Whether the stream at `stream_index` receives records.
    ///
    /// The stream of a single-stream batch is always written, even with no
    /// events; in a multi-stream batch, streams without events are check-only.
    pub fn is_write_target(&self, stream_index: usize) -> bool {
        self.is_single_stream() || self.streams[stream_index].event_count > 0
    }

    /// Event ids routed to the stream at `stream_index`, in log order.
    pub fn event_ids_for(&self, stream_index: usize) -> Vec<Uuid> {
        self.events
            .iter()
            .zip(&self.event_streams)
            .filter(|(_, s)| **s == stream_index)
            .map(|(e, _)| e.event_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    fn event(event_type: &str) -> ProposedEvent {
        ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            is_json: true,
            metadata: Bytes::new(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn request(names: &[&str], expected: &[i64], events: usize, indexes: &[i32]) -> AppendRequest {
        AppendRequest {
            stream_names: names.iter().map(|s| s.to_string()).collect(),
            expected_versions: expected.to_vec(),
            events: (0..events).map(|_| event("Tested")).collect(),
            event_stream_indexes: indexes.to_vec(),
        }
    }

    fn expect_invalid(req: AppendRequest, fragment: &str) {
        match req.validate() {
            Err(Error::InvalidArgument(msg)) => {
                assert!(msg.contains(fragment), "expected '{fragment}' in: {msg}")
            }
            Err(other) => panic!("expected InvalidArgument, got {other:?}"),
            Ok(_) => panic!("expected InvalidArgument, got Ok"),
        }
    }

    #[test]
    fn interleaved_batch_routes_events() {
        let batch = request(&["a", "b"], &[-2, -2], 3, &[0, 1, 0])
            .validate()
            .expect("valid batch");
        assert!(!batch.is_single_stream());
        assert_eq!(batch.streams()[0].event_count, 2);
        assert_eq!(batch.streams()[1].event_count, 1);
        assert_eq!(batch.stream_of_event(2), 0);
        assert_eq!(batch.event_ids_for(0).len(), 2);
    }

    #[test]
    fn single_stream_ignores_index_map() {
        let batch = request(&["a"], &[-2], 2, &[5, 9, 12])
            .validate()
            .expect("index map is ignored");
        assert_eq!(batch.streams()[0].event_count, 2);
        assert_eq!(batch.stream_of_event(1), 0);
    }

    #[test]
    fn single_stream_empty_write_is_allowed() {
        let batch = request(&["a"], &[2], 0, &[])
            .validate()
            .expect("empty single-stream write is valid");
        assert!(batch.is_write_target(0));
        assert!(batch.event_ids_for(0).is_empty());
    }

    #[test]
    fn check_only_stream_is_not_a_write_target() {
        let batch = request(&["a", "b"], &[-2, i64::MAX], 1, &[0])
            .validate()
            .expect("trailing check-only stream is valid");
        assert!(batch.is_write_target(0));
        assert!(!batch.is_write_target(1));
    }

    #[test]
    fn length_mismatch_is_malformed() {
        expect_invalid(request(&["a", "b"], &[-2], 2, &[0, 1]), "expected versions");
    }

    #[test]
    fn no_streams_is_malformed() {
        expect_invalid(request(&[], &[], 0, &[]), "at least one stream");
    }

    #[test]
    fn empty_and_bare_prefix_names_are_malformed() {
        expect_invalid(request(&[""], &[-2], 1, &[]), "empty");
        expect_invalid(request(&["$$"], &[-2], 1, &[]), "not a valid stream name");
    }

    #[test]
    fn duplicate_stream_name_is_malformed() {
        expect_invalid(request(&["a", "a"], &[-2, -2], 2, &[0, 1]), "more than once");
    }

    #[test]
    fn unrecognized_precondition_is_malformed() {
        expect_invalid(request(&["a"], &[-3], 1, &[]), "not recognized");
        expect_invalid(request(&["a"], &[-7], 1, &[]), "not recognized");
    }

    #[test]
    fn multi_stream_without_events_is_malformed() {
        expect_invalid(request(&["a", "b"], &[-2, -2], 0, &[]), "at least one event");
    }

    #[test]
    fn index_count_must_match_events() {
        expect_invalid(request(&["a", "b"], &[-2, -2], 2, &[0]), "event stream indexes");
    }

    #[test]
    fn out_of_range_index_is_malformed() {
        expect_invalid(request(&["a", "b"], &[-2, -2], 2, &[0, 2]), "only 2 streams");
        expect_invalid(request(&["a", "b"], &[-2, -2], 2, &[0, -1]), "only 2 streams");
    }

    #[test]
    fn first_use_order_must_follow_stream_order() {
        expect_invalid(request(&["a", "b"], &[-2, -2], 2, &[1, 0]), "before stream index 0");
        expect_invalid(
            request(&["a", "b", "c"], &[-2, -2, -2], 2, &[0, 2]),
            "before stream index 1",
        );
    }

    #[test]
    fn deleted_stream_on_write_target_is_malformed() {
        expect_invalid(request(&["a"], &[i64::MAX], 0, &[]), "written to");
        expect_invalid(
            request(&["a", "b"], &[i64::MAX, -2], 2, &[0, 1]),
            "written to",
        );
    }

    #[test]
    fn empty_event_type_is_malformed() {
        let mut req = request(&["a"], &[-2], 1, &[]);
        req.events[0].event_type.clear();
        expect_invalid(req, "empty event type");
    }

    #[test]
    fn oversized_event_type_is_malformed() {
        let mut req = request(&["a"], &[-2], 1, &[]);
        req.events[0].event_type = "x".repeat(MAX_EVENT_TYPE_LEN + 1);
        expect_invalid(req, "event type");
    }

    #[test]
    fn oversized_event_is_rejected() {
        let mut req = request(&["a"], &[-2], 1, &[]);
        req.events[0].payload = Bytes::from(vec![0u8; MAX_EVENT_SIZE]);
        match req.validate() {
            Err(Error::EventTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_EVENT_SIZE);
            }
            other => panic!("expected EventTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn single_stream_constructor_encodes_precondition() {
        let req = AppendRequest::single_stream("a", ExpectedVersion::Exact(4), vec![event("X")]);
        assert_eq!(req.expected_versions, vec![4]);
        let batch = req.validate().expect("valid");
        assert_eq!(batch.streams()[0].expected, ExpectedVersion::Exact(4));
    }
}
