//! # Stream Buffers
//!
//! Per-stream reassembly and send-side chunking. A [`Stream`] owns a
//! receive buffer (out-of-order segments keyed by offset, drained in
//! order) and a send buffer (queued payloads flushed as sized frames).
//! Flow control and retransmission live in collaborators; this layer is
//! ordering and framing only.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use crate::error::{ErrorCode, Result, TransportError};
use crate::frame::StreamFrame;
use crate::ids::{Offset, StreamId};

/// Largest stream payload placed in a single frame. Leaves room for the
/// public header and frame overhead inside a 1452-byte datagram.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 1200;

// ─── Receive Side ───────────────────────────────────────────────────────────

/// Out-of-order reassembly buffer.
///
/// Segments are keyed by their starting offset and are never trimmed or
/// merged. A segment starting at an offset we have already read past, or
/// whose offset is already buffered, is a retransmit and is dropped
/// without effect; data above a gap waits until the segment whose offset
/// exactly matches the read cursor arrives.
#[derive(Debug, Default)]
struct RecvBuffer {
    segments: BTreeMap<u64, Bytes>,
    read_offset: u64,
    fin_offset: Option<u64>,
}

impl RecvBuffer {
    fn receive(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        let end = offset + data.len() as u64;

        if let Some(fin_offset) = self.fin_offset {
            if end > fin_offset || (fin && end != fin_offset) {
                return Err(TransportError::new(
                    ErrorCode::INVALID_STREAM_DATA,
                    "data past the final offset",
                ));
            }
        }
        if fin {
            if self.read_offset > end {
                return Err(TransportError::new(
                    ErrorCode::INVALID_STREAM_DATA,
                    "final offset below delivered data",
                ));
            }
            self.fin_offset = Some(end);
        }

        if offset < self.read_offset || self.segments.contains_key(&offset) {
            // Retransmit of something already delivered or buffered. A
            // segment starting behind the cursor can never line up with
            // it again and is dropped whole rather than trimmed.
            return Ok(());
        }
        if !data.is_empty() {
            self.segments.insert(offset, data);
        }
        Ok(())
    }

    /// Pop the next in-order segments. The cursor advances only through
    /// segments whose offset exactly matches it.
    fn read(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(entry) = self.segments.first_entry() {
            let offset = *entry.key();
            if offset < self.read_offset {
                // Left behind when an overlapping segment carried the
                // cursor past this one; it can never match now.
                entry.remove();
                continue;
            }
            if offset > self.read_offset {
                break;
            }
            let (_, data) = entry.remove_entry();
            self.read_offset += data.len() as u64;
            out.push(data);
        }
        out
    }

    fn is_finished(&self) -> bool {
        self.fin_offset == Some(self.read_offset) && self.segments.is_empty()
    }
}

// ─── Send Side ──────────────────────────────────────────────────────────────

/// Queued outbound payloads awaiting framing.
#[derive(Debug, Default)]
struct SendBuffer {
    pending: VecDeque<Bytes>,
    write_offset: u64,
    fin_queued: bool,
    fin_sent: bool,
}

impl SendBuffer {
    fn write(&mut self, data: Bytes) -> Result<()> {
        if self.fin_queued {
            return Err(TransportError::new(
                ErrorCode::INVALID_STREAM_DATA,
                "write after finish",
            ));
        }
        if !data.is_empty() {
            self.pending.push_back(data);
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.fin_queued = true;
    }

    /// Drain pending data into frames of at most `max_payload` bytes.
    /// The last frame carries FIN when the stream is finished; a finished
    /// stream with no pending data emits one empty FIN frame.
    fn flush(&mut self, stream_id: StreamId, max_payload: usize) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(mut chunk) = self.pending.pop_front() {
            while !chunk.is_empty() {
                let take = chunk.len().min(max_payload);
                let data = chunk.split_to(take);
                let offset = Offset::from_u64(self.write_offset);
                self.write_offset += data.len() as u64;
                frames.push(StreamFrame {
                    stream_id,
                    offset,
                    fin: false,
                    data,
                });
            }
        }
        if self.fin_queued && !self.fin_sent {
            self.fin_sent = true;
            match frames.last_mut() {
                Some(last) => last.fin = true,
                None => frames.push(StreamFrame {
                    stream_id,
                    offset: Offset::from_u64(self.write_offset),
                    fin: true,
                    data: Bytes::new(),
                }),
            }
        }
        frames
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty() || (self.fin_queued && !self.fin_sent)
    }
}

// ─── Stream ─────────────────────────────────────────────────────────────────

/// One bidirectional ordered byte stream.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    recv: RecvBuffer,
    send: SendBuffer,
    finished_reported: bool,
}

impl Stream {
    pub fn new(id: StreamId) -> Self {
        Stream {
            id,
            recv: RecvBuffer::default(),
            send: SendBuffer::default(),
            finished_reported: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Apply an inbound frame. Duplicates and retransmits are idempotent.
    pub fn receive_frame(&mut self, frame: &StreamFrame) -> Result<()> {
        debug_assert_eq!(frame.stream_id, self.id);
        self.recv
            .receive(frame.offset.value(), frame.data.clone(), frame.fin)
    }

    /// Drain contiguous received data.
    pub fn read(&mut self) -> Vec<Bytes> {
        self.recv.read()
    }

    pub fn write(&mut self, data: Bytes) -> Result<()> {
        self.send.write(data)
    }

    /// No more local writes; the next flush carries FIN.
    pub fn finish(&mut self) {
        self.send.finish();
    }

    /// Frame up everything queued for sending.
    pub fn flush(&mut self, max_payload: usize) -> Vec<StreamFrame> {
        let frames = self.send.flush(self.id, max_payload);
        if !frames.is_empty() {
            debug!(stream_id = self.id.value(), frames = frames.len(), "flushed stream data");
        }
        frames
    }

    pub fn has_pending_send(&self) -> bool {
        self.send.has_pending()
    }

    /// True once the peer's FIN offset has been fully delivered. Fires
    /// once; later calls return false.
    pub fn take_finished(&mut self) -> bool {
        if !self.finished_reported && self.recv.is_finished() {
            self.finished_reported = true;
            true
        } else {
            false
        }
    }
}
