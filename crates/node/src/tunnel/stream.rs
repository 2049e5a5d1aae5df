//! Segmented request stream reassembly.
//!
//! A tunnel peer may ship a raw HTTP/1.1 request in pieces: a `control`
//! frame opens a named stream, `data` frames append base64 chunks, and the
//! node answers with a raw HTTP/1.1 response once the request is complete.
//! At most one stream is active; opening a second preempts the first and
//! its accumulator. The accumulator is hard-capped — an oversized request
//! is answered with a synthetic 413 and the stream is discarded.

use hublink_proto::http::{declared_content_length, try_parse_request, RawRequest};

/// Payload cap for one segmented request: a declared `Content-Length` of
/// exactly this many bytes is still accepted, one byte more is a 413.
pub const MAX_STREAM_REQUEST_BYTES: usize = 4_096;

/// Raw-byte headroom for the request line and headers on top of the
/// payload cap.
const HEADER_ALLOWANCE_BYTES: usize = 1_024;

/// Outcome of appending a chunk to the active stream.
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// More bytes needed.
    Incomplete,
    /// A full request has been reassembled; the stream stays open until
    /// the caller closes it after responding.
    Complete(RawRequest),
    /// Cap exceeded; the caller must answer 413 and discard.
    Overflow,
}

/// At most one inbound segmented stream.
#[derive(Debug, Default)]
pub struct StreamContext {
    active_stream_id: Option<String>,
    accumulator: Vec<u8>,
}

impl StreamContext {
    /// Opens a stream, preempting any prior accumulator.
    pub fn open(&mut self, stream_id: &str) {
        self.active_stream_id = Some(stream_id.to_string());
        self.accumulator.clear();
    }

    /// Closes the named stream; a mismatched id is ignored.
    pub fn close(&mut self, stream_id: &str) {
        if self.active_stream_id.as_deref() == Some(stream_id) {
            self.discard();
        }
    }

    /// Drops the active stream and its accumulator unconditionally.
    pub fn discard(&mut self) {
        self.active_stream_id = None;
        self.accumulator.clear();
    }

    pub fn is_open(&self) -> bool {
        self.active_stream_id.is_some()
    }

    pub fn active_stream_id(&self) -> Option<&str> {
        self.active_stream_id.as_deref()
    }

    /// Appends decoded bytes and attempts reassembly.
    pub fn append(&mut self, chunk: &[u8]) -> AppendOutcome {
        if self.active_stream_id.is_none() {
            return AppendOutcome::Incomplete;
        }
        if self.accumulator.len() + chunk.len() > MAX_STREAM_REQUEST_BYTES + HEADER_ALLOWANCE_BYTES
        {
            return AppendOutcome::Overflow;
        }
        self.accumulator.extend_from_slice(chunk);
        if let Some(declared) = declared_content_length(&self.accumulator) {
            if declared > MAX_STREAM_REQUEST_BYTES {
                return AppendOutcome::Overflow;
            }
        }
        match try_parse_request(&self.accumulator) {
            Some(request) => AppendOutcome::Complete(request),
            None => AppendOutcome::Incomplete,
        }
    }
}
