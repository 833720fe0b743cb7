//! Frame decoding: byte chunks in, protocol lines and typed events out.
//!
//! The decoder is chunk-boundary agnostic. A line, or a single multi-byte
//! character, may arrive split across any number of pulls and is reassembled
//! before anything is emitted.

use std::collections::VecDeque;

use memchr::memchr_iter;
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::protocol::{classify_line, ProtocolEvent};
use crate::source::ByteSource;

/// Incremental UTF-8 line framer.
///
/// Feed raw byte chunks in arbitrary boundaries; completed lines (terminated
/// by `\n`, with one trailing `\r` stripped) are appended to the caller's
/// buffer. Bytes after the last newline, and trailing fragments of a
/// multi-byte character, are carried over to the next feed.
pub struct LineDecoder {
    buffer: String,
    read_offset: usize,
    utf8_carry: Vec<u8>,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            utf8_carry: Vec::new(),
        }
    }

    /// Feed one byte chunk and append any completed lines to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        self.decode_chunk(chunk);
        self.drain_lines(out);
    }

    fn decode_chunk(&mut self, chunk: &[u8]) {
        if self.utf8_carry.is_empty() {
            match std::str::from_utf8(chunk) {
                Ok(text) => self.buffer.push_str(text),
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                    let text = unsafe { std::str::from_utf8_unchecked(&chunk[..valid_up_to]) };
                    self.buffer.push_str(text);
                    self.utf8_carry.extend_from_slice(&chunk[valid_up_to..]);
                }
            }
            return;
        }

        self.utf8_carry.extend_from_slice(chunk);
        match std::str::from_utf8(&self.utf8_carry) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.utf8_carry.clear();
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                let text = unsafe { std::str::from_utf8_unchecked(&self.utf8_carry[..valid_up_to]) };
                self.buffer.push_str(text);
                if valid_up_to > 0 {
                    let remain_len = self.utf8_carry.len() - valid_up_to;
                    self.utf8_carry.copy_within(valid_up_to.., 0);
                    self.utf8_carry.truncate(remain_len);
                }
            }
        }
    }

    fn drain_lines(&mut self, out: &mut Vec<String>) {
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            out.push(line.to_string());
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Upfront error envelope probe
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Probe a chunk, taken whole, for a non-streaming error envelope.
///
/// Attempted on the first chunk only: a transport that rejects the request
/// responds with a single JSON body instead of an event stream.
fn probe_error_envelope(chunk: &[u8]) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_slice(chunk).ok()?;
    Some(envelope.error.message)
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

struct EventStreamState<S> {
    source: S,
    decoder: LineDecoder,
    lines: Vec<String>,
    pending: VecDeque<Result<ProtocolEvent, Error>>,
    probed: bool,
    finished: bool,
}

/// Turn a byte source into a lazy, finite, non-restartable stream of typed
/// protocol events.
///
/// Termination rules:
/// - natural exhaustion of the source ends the stream cleanly;
/// - a read failure from the source ends the stream cleanly (transport
///   disconnects and cancellation are ordinary termination, not protocol
///   failure);
/// - the `[DONE]` sentinel ends the stream cleanly, indistinguishable from
///   exhaustion;
/// - a first-chunk error envelope or a malformed data line yields one `Err`
///   item and then ends the stream.
pub fn event_stream<S>(
    source: S,
) -> impl futures_util::Stream<Item = Result<ProtocolEvent, Error>> + Send
where
    S: ByteSource + 'static,
{
    futures_util::stream::unfold(
        EventStreamState {
            source,
            decoder: LineDecoder::new(),
            lines: Vec::new(),
            pending: VecDeque::new(),
            probed: false,
            finished: false,
        },
        |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.finished {
                    return None;
                }

                let chunk = match st.source.pull().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return None,
                    Err(err) => {
                        // Benign end: disconnects terminate, they do not fail.
                        debug!(error = %err, "byte source read failed; ending event stream");
                        return None;
                    }
                };

                if !st.probed {
                    st.probed = true;
                    if let Some(message) = probe_error_envelope(&chunk) {
                        st.finished = true;
                        return Some((Err(Error::Upstream(message)), st));
                    }
                }

                st.decoder.feed(&chunk, &mut st.lines);
                for line in st.lines.drain(..) {
                    match classify_line(&line) {
                        Ok(None) => {}
                        Ok(Some(ProtocolEvent::StreamEnd)) => {
                            st.finished = true;
                            break;
                        }
                        Ok(Some(event)) => st.pending.push_back(Ok(event)),
                        Err(err) => {
                            st.pending.push_back(Err(err));
                            st.finished = true;
                            break;
                        }
                    }
                }
            }
        },
    )
}
