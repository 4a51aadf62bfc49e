//! # ACK Range Compressor
//!
//! Acknowledgement state is a set of closed packet-number intervals,
//! compressed on the wire into gap/run-length block pairs. Each pair is
//! `(gap: u8, block-length: declared width)` counting down from the largest
//! acknowledged number. A gap wider than 255 is split across continuation
//! entries whose block length is 0; the decoder merges those back into one
//! logical gap, and discards an incomplete trailing split outright.
//!
//! The delay field uses a lossy 16-bit unsigned float (5-bit exponent,
//! 11-bit mantissa): values below 2^12 round-trip exactly, larger values
//! lose low bits, and everything at or above the maximum saturates to it.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ErrorCode, Result, TransportError};
use crate::ids::PacketNumber;

/// Maximum number of (gap, length) pairs in one ACK frame (1-byte count).
pub const MAX_ACK_BLOCKS: usize = 255;

// ─── Ack Range ──────────────────────────────────────────────────────────────

/// A closed interval `[first, last]` of packet numbers known received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub first: u64,
    pub last: u64,
}

impl AckRange {
    pub fn new(first: u64, last: u64) -> Self {
        AckRange { first, last }
    }

    /// Number of packets covered by this range.
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn contains(&self, n: u64) -> bool {
        self.first <= n && n <= self.last
    }
}

// ─── Ack Frame ──────────────────────────────────────────────────────────────

/// Decoded acknowledgement state.
///
/// `ranges` is empty when the acked interval `[lowest, largest]` is
/// contiguous. Otherwise it lists the received intervals descending by
/// `last`, with a boundary gap of at least 2 between consecutive entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: u64,
    pub lowest_acked: u64,
    /// Ack delay in microseconds (lossy above 2^12).
    pub delay_us: u64,
    pub ranges: Vec<AckRange>,
}

impl AckFrame {
    /// An ACK covering one contiguous interval.
    pub fn contiguous(lowest: u64, largest: u64, delay_us: u64) -> Self {
        AckFrame {
            largest_acked: largest,
            lowest_acked: lowest,
            delay_us,
            ranges: Vec::new(),
        }
    }

    /// An ACK with explicit missing-range structure. `ranges` descending.
    pub fn with_ranges(delay_us: u64, ranges: Vec<AckRange>) -> Self {
        let largest = ranges.first().map(|r| r.last).unwrap_or(0);
        let lowest = ranges.last().map(|r| r.first).unwrap_or(0);
        AckFrame {
            largest_acked: largest,
            lowest_acked: lowest,
            delay_us,
            ranges,
        }
    }

    /// Whether packet `n` is acknowledged by this frame.
    pub fn acks_packet(&self, n: u64) -> bool {
        if n < self.lowest_acked || n > self.largest_acked {
            return false;
        }
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|r| r.contains(n))
    }

    /// Structural validity of the range list.
    ///
    /// Valid iff empty, or at least two entries with: the first entry's
    /// upper bound equal to `largest_acked`, every `first <= last`, strictly
    /// descending order, and a boundary gap of at least 2 between entries.
    /// A lone range is always invalid — a single contiguous run needs no
    /// gap encoding at all.
    pub fn validate_ranges(&self) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        if self.ranges.len() < 2 {
            return false;
        }
        if self.ranges[0].last != self.largest_acked {
            return false;
        }
        if self.ranges.iter().any(|r| r.first > r.last) {
            return false;
        }
        self.ranges.windows(2).all(|w| {
            let (hi, lo) = (w[0], w[1]);
            hi.first > lo.last && hi.first - lo.last >= 2
        })
    }

    // ─── Wire codec ─────────────────────────────────────────────────────

    /// Encode this frame, type byte included.
    ///
    /// The minimal width codes that fit `largest_acked` and the widest
    /// block length are chosen, so re-encoding a decoded frame is
    /// byte-identical.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let largest = PacketNumber::new(self.largest_acked).ok_or_else(|| {
            TransportError::new(ErrorCode::INVALID_ACK_DATA, "largest acked out of range")
        })?;
        if !self.validate_ranges() {
            return Err(TransportError::new(
                ErrorCode::INVALID_ACK_DATA,
                "invalid ack range structure",
            ));
        }

        let has_missing = !self.ranges.is_empty();
        let (first_block_len, entries) = self.build_entries();

        let max_block = entries
            .iter()
            .map(|&(_, len)| len)
            .fold(first_block_len, u64::max);
        let (block_width, block_code) = uint_width(max_block);

        let type_byte = 0x40
            | (u8::from(has_missing) << 5)
            | (largest.flag_code() << 3)
            | block_code;
        buf.put_u8(type_byte);
        largest.encode(buf);
        buf.put_u16_le(encode_ufloat16(self.delay_us));
        if has_missing {
            buf.put_u8(entries.len() as u8);
        }
        buf.put_uint_le(first_block_len, block_width);
        for &(gap, len) in &entries {
            buf.put_u8(gap);
            buf.put_uint_le(len, block_width);
        }
        // Timestamp section: not modeled, emitted empty.
        buf.put_u8(0);
        Ok(())
    }

    /// Flatten the range list into wire (gap, length) pairs, splitting
    /// gaps wider than 255 into zero-length continuation entries and
    /// dropping the lowest ranges once the 255-pair budget is spent.
    fn build_entries(&self) -> (u64, Vec<(u8, u64)>) {
        if self.ranges.is_empty() {
            return (self.largest_acked - self.lowest_acked + 1, Vec::new());
        }
        let first_block_len = self.ranges[0].len();
        let mut entries: Vec<(u8, u64)> = Vec::new();
        let mut prev_first = self.ranges[0].first;
        for range in &self.ranges[1..] {
            let mut gap = prev_first - range.last - 1;
            let mut pending: Vec<(u8, u64)> = Vec::new();
            while gap > 255 {
                pending.push((255, 0));
                gap -= 255;
            }
            pending.push((gap as u8, range.len()));
            if entries.len() + pending.len() > MAX_ACK_BLOCKS {
                break;
            }
            entries.extend(pending);
            prev_first = range.first;
        }
        (first_block_len, entries)
    }

    /// Decode the body following an ACK type byte.
    pub fn decode(type_byte: u8, buf: &mut impl Buf) -> Result<Self> {
        debug_assert_eq!(type_byte & 0xC0, 0x40);
        let has_missing = type_byte & 0x20 != 0;
        let largest_width = PacketNumber::width_from_code((type_byte >> 3) & 0b11);
        let block_width = PacketNumber::width_from_code(type_byte & 0b11);

        if buf.remaining() < largest_width + 2 {
            return Err(TransportError::short(ErrorCode::INVALID_ACK_DATA, "ack header"));
        }
        let largest = buf.get_uint_le(largest_width);
        let delay_us = decode_ufloat16(buf.get_u16_le());

        let num_entries = if has_missing {
            if !buf.has_remaining() {
                return Err(TransportError::short(ErrorCode::INVALID_ACK_DATA, "block count"));
            }
            buf.get_u8() as usize
        } else {
            0
        };

        if buf.remaining() < block_width {
            return Err(TransportError::short(ErrorCode::INVALID_ACK_DATA, "first block"));
        }
        let first_block_len = buf.get_uint_le(block_width);
        if first_block_len == 0 || first_block_len > largest {
            return Err(TransportError::new(
                ErrorCode::INVALID_ACK_DATA,
                "first ack block out of range",
            ));
        }

        // Walk downward from the largest acked, merging zero-length
        // continuation entries into the pending gap.
        let mut cursor = largest + 1 - first_block_len;
        let mut ranges = Vec::new();
        if has_missing {
            ranges.push(AckRange::new(cursor, largest));
        }
        for _ in 0..num_entries {
            if buf.remaining() < 1 + block_width {
                return Err(TransportError::short(ErrorCode::INVALID_ACK_DATA, "ack block"));
            }
            let gap = buf.get_u8() as u64;
            let len = buf.get_uint_le(block_width);
            if gap + len >= cursor {
                return Err(TransportError::new(
                    ErrorCode::INVALID_ACK_DATA,
                    "ack block underflows packet number space",
                ));
            }
            cursor -= gap + len;
            if len > 0 {
                ranges.push(AckRange::new(cursor, cursor + len - 1));
            }
            // len == 0: continuation of a split gap; an incomplete
            // trailing split leaves no partial range behind.
        }

        let lowest = ranges.last().map(|r| r.first).unwrap_or(cursor);
        let frame = AckFrame {
            largest_acked: largest,
            lowest_acked: lowest,
            delay_us,
            ranges,
        };
        if has_missing && !frame.validate_ranges() {
            return Err(TransportError::new(
                ErrorCode::INVALID_ACK_DATA,
                "decoded ack ranges fail validation",
            ));
        }

        // Timestamp section: count byte, then 1+4 bytes for the first
        // entry and 1+2 for each further entry. Consumed, not modeled.
        if !buf.has_remaining() {
            return Err(TransportError::short(ErrorCode::INVALID_ACK_DATA, "timestamp count"));
        }
        let ts_count = buf.get_u8() as usize;
        if ts_count > 0 {
            let ts_len = 5 + (ts_count - 1) * 3;
            if buf.remaining() < ts_len {
                return Err(TransportError::short(ErrorCode::INVALID_ACK_DATA, "timestamps"));
            }
            buf.advance(ts_len);
        }

        Ok(frame)
    }
}

/// Minimal {1, 2, 4, 6}-byte width and 2-bit code for an unsigned value.
fn uint_width(value: u64) -> (usize, u8) {
    if value <= 0xFF {
        (1, 0b00)
    } else if value <= 0xFFFF {
        (2, 0b01)
    } else if value <= 0xFFFF_FFFF {
        (4, 0b10)
    } else {
        (6, 0b11)
    }
}

// ─── UFloat16 ───────────────────────────────────────────────────────────────

/// Largest value representable by the 16-bit unsigned float.
pub const UFLOAT16_MAX: u64 = 0xFFF << 30;

/// Encode a microsecond count into the lossy 16-bit unsigned float.
pub fn encode_ufloat16(mut value: u64) -> u16 {
    if value < (1 << 12) {
        value as u16
    } else if value >= UFLOAT16_MAX {
        u16::MAX
    } else {
        let mut exponent: u16 = 0;
        while value >= (1 << 12) {
            value >>= 1;
            exponent += 1;
        }
        (exponent << 11) + value as u16
    }
}

/// Decode the 16-bit unsigned float back to microseconds.
pub fn decode_ufloat16(encoded: u16) -> u64 {
    let value = encoded as u64;
    if value < (1 << 12) {
        return value;
    }
    let exponent = (value >> 11) - 1;
    let mantissa = (value & 0x7FF) | 0x800;
    mantissa << exponent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &AckFrame) -> AckFrame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        let mut buf = buf.freeze();
        let type_byte = buf.get_u8();
        AckFrame::decode(type_byte, &mut buf).unwrap()
    }

    // ─── Compression laws ───────────────────────────────────────────────

    #[test]
    fn roundtrip_two_ranges() {
        let frame = AckFrame::with_ranges(
            1000,
            vec![AckRange::new(25, 40), AckRange::new(1, 23)],
        );
        assert_eq!(frame.largest_acked, 40);
        assert_eq!(frame.lowest_acked, 1);
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.largest_acked, 40);
        assert_eq!(decoded.lowest_acked, 1);
        assert_eq!(
            decoded.ranges,
            vec![AckRange::new(25, 40), AckRange::new(1, 23)]
        );
    }

    #[test]
    fn roundtrip_contiguous() {
        let frame = AckFrame::contiguous(5, 900, 0);
        let decoded = roundtrip(&frame);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn gap_of_255_is_single_entry() {
        // 300 - 44 - 1 == 255 missing packets between the ranges.
        let frame = AckFrame::with_ranges(
            0,
            vec![AckRange::new(300, 310), AckRange::new(40, 44)],
        );
        let (first_block, entries) = frame.build_entries();
        assert_eq!(first_block, 11);
        assert_eq!(entries, vec![(255, 5)]);
        assert_eq!(roundtrip(&frame).ranges, frame.ranges);
    }

    #[test]
    fn gap_of_256_splits_into_two_entries() {
        // 300 - 43 - 1 == 256 missing packets: needs a continuation entry.
        let frame = AckFrame::with_ranges(
            0,
            vec![AckRange::new(300, 310), AckRange::new(40, 43)],
        );
        let (_, entries) = frame.build_entries();
        assert_eq!(entries, vec![(255, 0), (1, 4)]);
        // The continuation merges back into one logical range.
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.ranges, frame.ranges);
        assert_eq!(decoded.lowest_acked, 40);
    }

    #[test]
    fn incomplete_trailing_split_discarded() {
        // Hand-build: largest 1000, first block 10, then (1, 5) and a
        // dangling (255, 0) continuation that never terminates.
        let mut buf = BytesMut::new();
        let type_byte = 0x40 | (1 << 5) | (0b01 << 3); // missing, 2-byte largest, 1-byte blocks
        buf.put_uint_le(1000, 2);
        buf.put_u16_le(0);
        buf.put_u8(2); // two entries
        buf.put_u8(10); // first block
        buf.put_u8(1);
        buf.put_u8(5);
        buf.put_u8(255);
        buf.put_u8(0);
        buf.put_u8(0); // timestamps
        let decoded = AckFrame::decode(type_byte, &mut buf.freeze()).unwrap();
        assert_eq!(
            decoded.ranges,
            vec![AckRange::new(991, 1000), AckRange::new(985, 989)]
        );
        assert_eq!(decoded.lowest_acked, 985);
    }

    #[test]
    fn block_budget_drops_oldest_ranges() {
        // 300 ranges needs 299 pairs; only 255 fit, so the lowest ranges
        // are dropped while recent ones stay complete.
        let ranges: Vec<AckRange> = (0..300)
            .map(|i| {
                let n = 10_000 - 2 * i;
                AckRange::new(n, n)
            })
            .collect();
        let frame = AckFrame::with_ranges(0, ranges);
        let (_, entries) = frame.build_entries();
        assert_eq!(entries.len(), 255);
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.ranges.len(), 256);
        assert_eq!(decoded.largest_acked, 10_000);
        assert_eq!(decoded.lowest_acked, 10_000 - 2 * 255);
    }

    // ─── Validation ─────────────────────────────────────────────────────

    #[test]
    fn lone_range_invalid() {
        let frame = AckFrame {
            largest_acked: 10,
            lowest_acked: 1,
            delay_us: 0,
            ranges: vec![AckRange::new(1, 10)],
        };
        assert!(!frame.validate_ranges());
    }

    #[test]
    fn first_range_must_touch_largest() {
        let frame = AckFrame {
            largest_acked: 10,
            lowest_acked: 2,
            delay_us: 0,
            ranges: vec![AckRange::new(8, 9), AckRange::new(2, 3)],
        };
        assert!(!frame.validate_ranges());
    }

    #[test]
    fn overlapping_ranges_invalid() {
        let frame = AckFrame {
            largest_acked: 7,
            lowest_acked: 2,
            delay_us: 0,
            ranges: vec![AckRange::new(5, 7), AckRange::new(2, 5)],
        };
        assert!(!frame.validate_ranges());
    }

    #[test]
    fn adjacent_ranges_invalid() {
        // Boundary gap of exactly 1: should have been one range.
        let frame = AckFrame {
            largest_acked: 9,
            lowest_acked: 1,
            delay_us: 0,
            ranges: vec![AckRange::new(5, 9), AckRange::new(1, 4)],
        };
        assert!(!frame.validate_ranges());
    }

    #[test]
    fn empty_ranges_valid() {
        assert!(AckFrame::contiguous(1, 50, 0).validate_ranges());
    }

    #[test]
    fn decode_rejects_invalid_structure() {
        // Missing-ranges flag set but only one block: lone range.
        let mut buf = BytesMut::new();
        let type_byte = 0x40 | (1 << 5);
        buf.put_u8(10); // largest
        buf.put_u16_le(0);
        buf.put_u8(0); // zero extra entries
        buf.put_u8(10); // first block covers everything
        buf.put_u8(0);
        let err = AckFrame::decode(type_byte, &mut buf.freeze()).unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_ACK_DATA);
    }

    // ─── acks_packet ────────────────────────────────────────────────────

    #[test]
    fn acks_packet_with_ranges() {
        let frame = AckFrame {
            largest_acked: 20,
            lowest_acked: 5,
            delay_us: 0,
            ranges: vec![AckRange::new(15, 20), AckRange::new(5, 8)],
        };
        assert!(!frame.acks_packet(9));
        assert!(frame.acks_packet(15));
        assert!(!frame.acks_packet(21));
        assert!(frame.acks_packet(5));
        assert!(!frame.acks_packet(4));
    }

    #[test]
    fn acks_packet_contiguous() {
        let frame = AckFrame::contiguous(5, 20, 0);
        assert!(frame.acks_packet(5));
        assert!(frame.acks_packet(13));
        assert!(frame.acks_packet(20));
        assert!(!frame.acks_packet(4));
        assert!(!frame.acks_packet(21));
    }

    // ─── UFloat16 ───────────────────────────────────────────────────────

    #[test]
    fn ufloat16_exact_below_2_pow_12() {
        for value in [0u64, 1, 100, 4095] {
            assert_eq!(decode_ufloat16(encode_ufloat16(value)), value);
        }
    }

    #[test]
    fn ufloat16_lossy_roundtrip_is_stable() {
        for value in [4096u64, 5000, 123_456, 9_999_999, 1 << 40] {
            let once = decode_ufloat16(encode_ufloat16(value));
            assert!(once <= value);
            // Re-encoding the decoded value is a fixed point.
            assert_eq!(decode_ufloat16(encode_ufloat16(once)), once);
        }
    }

    #[test]
    fn ufloat16_saturates_at_max() {
        assert_eq!(encode_ufloat16(UFLOAT16_MAX), u16::MAX);
        assert_eq!(encode_ufloat16(u64::MAX), u16::MAX);
        assert_eq!(decode_ufloat16(u16::MAX), UFLOAT16_MAX);
    }

    #[test]
    fn delay_survives_roundtrip() {
        let frame = AckFrame::contiguous(1, 9, 3000);
        assert_eq!(roundtrip(&frame).delay_us, 3000);
    }
}
