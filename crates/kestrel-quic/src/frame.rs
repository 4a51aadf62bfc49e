//! # Frame Codec
//!
//! A single leading byte discriminates the eleven frame kinds:
//!
//! ```text
//! 1 F D OOO SS   STREAM (0x80-0xFF): FIN, has-data, offset code, stream-id code
//! 0 1 M LL _ BB  ACK    (0x40-0x7F): missing-ranges, largest-acked code, block code
//! 0 0 1 .....    CONGESTION_FEEDBACK (0x20-0x3F)
//! 0 0 0 00xxx    fixed controls 0x00-0x07
//! ```
//!
//! Fixed controls in order: PADDING(0), RST_STREAM(1), CONNECTION_CLOSE(2),
//! GOAWAY(3), WINDOW_UPDATE(4), BLOCKED(5), STOP_WAITING(6), PING(7).
//! Bytes 0x08-0x1F are reserved and rejected.
//!
//! Every frame is self-delimiting: decoding consumes exactly the bytes the
//! type byte (plus any explicit length fields) declares, never an external
//! total-length hint. Encoding picks minimal width codes, so
//! `decode(encode(f)) == f` byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ack::AckFrame;
use crate::error::{ErrorCode, Result, TransportError};
use crate::ids::{Offset, StreamId};

// Fixed control frame type bytes.
const TYPE_PADDING: u8 = 0x00;
const TYPE_RST_STREAM: u8 = 0x01;
const TYPE_CONNECTION_CLOSE: u8 = 0x02;
const TYPE_GOAWAY: u8 = 0x03;
const TYPE_WINDOW_UPDATE: u8 = 0x04;
const TYPE_BLOCKED: u8 = 0x05;
const TYPE_STOP_WAITING: u8 = 0x06;
const TYPE_PING: u8 = 0x07;

/// Canonical type byte for CONGESTION_FEEDBACK (any 0x20-0x3F decodes).
const TYPE_CONGESTION_FEEDBACK: u8 = 0x20;

// ─── Stream Frame ───────────────────────────────────────────────────────────

/// A STREAM frame: a slice of one stream's byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: Offset,
    pub fin: bool,
    pub data: Bytes,
}

impl StreamFrame {
    /// Encode, type byte included. The has-data bit is set iff `data` is
    /// non-empty; a clear bit means zero payload bytes follow.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.data.len() > u16::MAX as usize {
            return Err(TransportError::new(
                ErrorCode::INTERNAL_ERROR,
                "stream frame data exceeds 16-bit length field",
            ));
        }
        let has_data = !self.data.is_empty();
        let type_byte = 0x80
            | (u8::from(self.fin) << 6)
            | (u8::from(has_data) << 5)
            | (self.offset.flag_code() << 2)
            | self.stream_id.flag_code();
        buf.put_u8(type_byte);
        self.stream_id.encode(buf);
        self.offset.encode(buf);
        if has_data {
            buf.put_u16_le(self.data.len() as u16);
            buf.put_slice(&self.data);
        }
        Ok(())
    }

    /// Decode the body following a STREAM type byte.
    pub fn decode(type_byte: u8, buf: &mut impl Buf) -> Result<Self> {
        debug_assert!(type_byte & 0x80 != 0);
        let fin = type_byte & 0x40 != 0;
        let has_data = type_byte & 0x20 != 0;
        let offset_width = Offset::width_from_code((type_byte >> 2) & 0b111);
        let id_width = StreamId::width_from_code(type_byte & 0b11);

        let stream_id = StreamId::decode(buf, id_width)
            .ok_or_else(|| TransportError::short(ErrorCode::INVALID_STREAM_DATA, "stream id"))?;
        let offset = Offset::decode(buf, offset_width)
            .ok_or_else(|| TransportError::short(ErrorCode::INVALID_STREAM_DATA, "offset"))?;
        let data = if has_data {
            if buf.remaining() < 2 {
                return Err(TransportError::short(
                    ErrorCode::INVALID_STREAM_DATA,
                    "data length",
                ));
            }
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(TransportError::short(
                    ErrorCode::INVALID_STREAM_DATA,
                    "stream data",
                ));
            }
            buf.copy_to_bytes(len)
        } else {
            Bytes::new()
        };

        Ok(StreamFrame {
            stream_id,
            offset,
            fin,
            data,
        })
    }
}

// ─── Frame ──────────────────────────────────────────────────────────────────

/// The closed set of frame kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    RstStream {
        stream_id: StreamId,
        byte_offset: u64,
        error_code: ErrorCode,
    },
    ConnectionClose {
        error_code: ErrorCode,
        reason: String,
    },
    GoAway {
        error_code: ErrorCode,
        last_good_stream_id: StreamId,
        reason: String,
    },
    WindowUpdate {
        stream_id: StreamId,
        byte_offset: u64,
    },
    Blocked {
        stream_id: StreamId,
    },
    StopWaiting {
        /// Distance from the carrying packet's number to the least
        /// unacked packet, as a full 48-bit value.
        least_unacked_delta: u64,
    },
    Ping,
    CongestionFeedback,
    Ack(AckFrame),
    Stream(StreamFrame),
}

impl Frame {
    /// Short kind name for logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Padding => "PADDING",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::ConnectionClose { .. } => "CONNECTION_CLOSE",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Blocked { .. } => "BLOCKED",
            Frame::StopWaiting { .. } => "STOP_WAITING",
            Frame::Ping => "PING",
            Frame::CongestionFeedback => "CONGESTION_FEEDBACK",
            Frame::Ack(_) => "ACK",
            Frame::Stream(_) => "STREAM",
        }
    }

    /// Encode this frame, type byte included.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Frame::Padding => buf.put_u8(TYPE_PADDING),
            Frame::RstStream {
                stream_id,
                byte_offset,
                error_code,
            } => {
                buf.put_u8(TYPE_RST_STREAM);
                buf.put_u32_le(stream_id.value());
                buf.put_u64_le(*byte_offset);
                buf.put_u32_le(error_code.0);
            }
            Frame::ConnectionClose { error_code, reason } => {
                buf.put_u8(TYPE_CONNECTION_CLOSE);
                buf.put_u32_le(error_code.0);
                put_reason(buf, reason)?;
            }
            Frame::GoAway {
                error_code,
                last_good_stream_id,
                reason,
            } => {
                buf.put_u8(TYPE_GOAWAY);
                buf.put_u32_le(error_code.0);
                buf.put_u32_le(last_good_stream_id.value());
                put_reason(buf, reason)?;
            }
            Frame::WindowUpdate {
                stream_id,
                byte_offset,
            } => {
                buf.put_u8(TYPE_WINDOW_UPDATE);
                buf.put_u32_le(stream_id.value());
                buf.put_u64_le(*byte_offset);
            }
            Frame::Blocked { stream_id } => {
                buf.put_u8(TYPE_BLOCKED);
                buf.put_u32_le(stream_id.value());
            }
            Frame::StopWaiting {
                least_unacked_delta,
            } => {
                buf.put_u8(TYPE_STOP_WAITING);
                buf.put_uint_le(*least_unacked_delta, 6);
            }
            Frame::Ping => buf.put_u8(TYPE_PING),
            Frame::CongestionFeedback => buf.put_u8(TYPE_CONGESTION_FEEDBACK),
            Frame::Ack(ack) => ack.encode(buf)?,
            Frame::Stream(stream) => stream.encode(buf)?,
        }
        Ok(())
    }

    /// Decode one frame from the front of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Frame> {
        if !buf.has_remaining() {
            return Err(TransportError::short(ErrorCode::INVALID_FRAME_DATA, "frame type"));
        }
        let type_byte = buf.get_u8();

        if type_byte & 0x80 != 0 {
            return StreamFrame::decode(type_byte, buf).map(Frame::Stream);
        }
        if type_byte & 0x40 != 0 {
            return AckFrame::decode(type_byte, buf).map(Frame::Ack);
        }
        if type_byte & 0x20 != 0 {
            return Ok(Frame::CongestionFeedback);
        }

        match type_byte {
            TYPE_PADDING => Ok(Frame::Padding),
            TYPE_RST_STREAM => {
                if buf.remaining() < 16 {
                    return Err(TransportError::short(
                        ErrorCode::INVALID_RST_STREAM_DATA,
                        "rst_stream body",
                    ));
                }
                Ok(Frame::RstStream {
                    stream_id: StreamId::new(buf.get_u32_le()),
                    byte_offset: buf.get_u64_le(),
                    error_code: ErrorCode(buf.get_u32_le()),
                })
            }
            TYPE_CONNECTION_CLOSE => {
                if buf.remaining() < 6 {
                    return Err(TransportError::short(
                        ErrorCode::INVALID_CONNECTION_CLOSE_DATA,
                        "connection_close body",
                    ));
                }
                let error_code = ErrorCode(buf.get_u32_le());
                let reason = get_reason(buf, ErrorCode::INVALID_CONNECTION_CLOSE_DATA)?;
                Ok(Frame::ConnectionClose { error_code, reason })
            }
            TYPE_GOAWAY => {
                if buf.remaining() < 10 {
                    return Err(TransportError::short(
                        ErrorCode::INVALID_GOAWAY_DATA,
                        "goaway body",
                    ));
                }
                let error_code = ErrorCode(buf.get_u32_le());
                let last_good_stream_id = StreamId::new(buf.get_u32_le());
                let reason = get_reason(buf, ErrorCode::INVALID_GOAWAY_DATA)?;
                Ok(Frame::GoAway {
                    error_code,
                    last_good_stream_id,
                    reason,
                })
            }
            TYPE_WINDOW_UPDATE => {
                if buf.remaining() < 12 {
                    return Err(TransportError::short(
                        ErrorCode::INVALID_WINDOW_UPDATE_DATA,
                        "window_update body",
                    ));
                }
                Ok(Frame::WindowUpdate {
                    stream_id: StreamId::new(buf.get_u32_le()),
                    byte_offset: buf.get_u64_le(),
                })
            }
            TYPE_BLOCKED => {
                if buf.remaining() < 4 {
                    return Err(TransportError::short(
                        ErrorCode::INVALID_BLOCKED_DATA,
                        "blocked body",
                    ));
                }
                Ok(Frame::Blocked {
                    stream_id: StreamId::new(buf.get_u32_le()),
                })
            }
            TYPE_STOP_WAITING => {
                if buf.remaining() < 6 {
                    return Err(TransportError::short(
                        ErrorCode::INVALID_STOP_WAITING_DATA,
                        "stop_waiting body",
                    ));
                }
                Ok(Frame::StopWaiting {
                    least_unacked_delta: buf.get_uint_le(6),
                })
            }
            TYPE_PING => Ok(Frame::Ping),
            other => Err(TransportError::new(
                ErrorCode::INVALID_FRAME_DATA,
                format!("reserved frame type byte {other:#04x}"),
            )),
        }
    }
}

/// Write a 16-bit-length-prefixed UTF-8 reason phrase.
fn put_reason(buf: &mut BytesMut, reason: &str) -> Result<()> {
    if reason.len() > u16::MAX as usize {
        return Err(TransportError::new(
            ErrorCode::INTERNAL_ERROR,
            "reason phrase exceeds 16-bit length field",
        ));
    }
    buf.put_u16_le(reason.len() as u16);
    buf.put_slice(reason.as_bytes());
    Ok(())
}

/// Read a 16-bit-length-prefixed UTF-8 reason phrase.
fn get_reason(buf: &mut impl Buf, code: ErrorCode) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(TransportError::short(code, "reason length"));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(TransportError::short(code, "reason phrase"));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::new(code, "reason phrase is not valid UTF-8"))
}
