//! # Identifier Codec
//!
//! Compact variable-length binary encodings for the protocol's identifier
//! types. Each numeric identifier picks the smallest width from a fixed set
//! that can represent the value, and reports that width as a 2- or 3-bit
//! flag code so frame and packet type bytes can declare it without a
//! separate length field:
//!
//! - [`PacketNumber`] — widths {1, 2, 4, 6}, values `1..=2^48-1`
//! - [`StreamId`]     — widths {1, 2, 3, 4}, values `0..=2^32-1`
//! - [`Offset`]       — widths {0, 2, 3, 4, 5, 6, 7}
//!
//! All integer fields are little-endian on the wire. Encoding is canonical
//! (minimal width), so re-encoding a decoded value is byte-identical.
//! Decoding always takes the declared width from whoever parsed the flag
//! code; it never guesses.

use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

// ─── Connection ID ──────────────────────────────────────────────────────────

/// An 8-byte connection identifier, generated from a secure random source.
///
/// Stable across address migration; compared byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId([u8; 8]);

impl ConnectionId {
    pub const SIZE: usize = 8;

    /// Generate a fresh random connection id.
    pub fn generate() -> Self {
        use rand::RngExt;
        let id: u64 = rand::rng().random();
        ConnectionId(id.to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        ConnectionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        let mut bytes = [0u8; 8];
        buf.copy_to_slice(&mut bytes);
        Some(ConnectionId(bytes))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ─── Packet Number ──────────────────────────────────────────────────────────

/// A packet sequence number in `1..=2^48-1`, encoded in 1, 2, 4 or 6 bytes.
///
/// Zero is never a valid value, which keeps "absent" unambiguous. Values
/// wrap from the maximum back to 1; `next` produces a new instance rather
/// than mutating in place.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber(u64);

impl PacketNumber {
    /// Maximum representable value: 2^48 - 1.
    pub const MAX: u64 = (1 << 48) - 1;

    /// The first packet number of every session.
    pub const FIRST: PacketNumber = PacketNumber(1);

    /// Create a packet number, returning `None` for 0 or out-of-range values.
    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        if val >= 1 && val <= Self::MAX {
            Some(PacketNumber(val))
        } else {
            None
        }
    }

    /// Create from a u64, panicking if out of range.
    #[inline]
    pub fn from_u64(val: u64) -> Self {
        Self::new(val).expect("packet number out of range")
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to: 1, 2, 4 or 6.
    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 <= 0xFF {
            1
        } else if self.0 <= 0xFFFF {
            2
        } else if self.0 <= 0xFFFF_FFFF {
            4
        } else {
            6
        }
    }

    /// 2-bit width code declared in frame/packet type bytes.
    #[inline]
    pub fn flag_code(self) -> u8 {
        match self.encoded_len() {
            1 => 0b00,
            2 => 0b01,
            4 => 0b10,
            6 => 0b11,
            _ => unreachable!(),
        }
    }

    /// Width in bytes for a 2-bit code.
    #[inline]
    pub fn width_from_code(code: u8) -> usize {
        match code & 0b11 {
            0b00 => 1,
            0b01 => 2,
            0b10 => 4,
            0b11 => 6,
            _ => unreachable!(),
        }
    }

    /// Encode little-endian at the canonical minimal width.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_uint_le(self.0, self.encoded_len());
    }

    /// Decode exactly `width` little-endian bytes. Rejects the value 0.
    pub fn decode(buf: &mut impl Buf, width: usize) -> Option<Self> {
        if buf.remaining() < width {
            return None;
        }
        Self::new(buf.get_uint_le(width))
    }

    /// The next packet number, wrapping from `MAX` back to 1.
    #[inline]
    pub fn next(self) -> PacketNumber {
        if self.0 == Self::MAX {
            PacketNumber(1)
        } else {
            PacketNumber(self.0 + 1)
        }
    }

    /// Absolute distance between two packet numbers.
    #[inline]
    pub fn delta(self, other: PacketNumber) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Reconstruct a full 48-bit packet number from a truncated wire field.
    ///
    /// `truncated` holds the low `width * 8` bits as sent by the peer;
    /// `reference` is the nearest known full number (typically the largest
    /// seen). The candidate from the epoch below, at, or above the reference
    /// that lands closest to it wins, restricted to the valid range.
    pub fn reconstruct(truncated: u64, width: usize, reference: PacketNumber) -> Option<Self> {
        debug_assert!(matches!(width, 1 | 2 | 4 | 6));
        if width >= 6 {
            return Self::new(truncated);
        }
        let window = 1u64 << (width * 8);
        let epoch = reference.0 & !(window - 1);
        [epoch.wrapping_sub(window), epoch, epoch + window]
            .iter()
            .filter_map(|&base| Self::new(base.wrapping_add(truncated)))
            .min_by_key(|c| c.delta(reference))
    }
}

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketNumber({})", self.0)
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Stream ID ──────────────────────────────────────────────────────────────

/// A stream identifier in `0..=2^32-1`, encoded in 1-4 bytes.
///
/// Allocation advances by 2, preserving parity between the endpoints: the
/// listening side uses even ids, the initiating side odd ids, so the two
/// allocate independently without collision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(val: u32) -> Self {
        StreamId(val)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Number of bytes this value encodes to: 1-4.
    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 <= 0xFF {
            1
        } else if self.0 <= 0xFFFF {
            2
        } else if self.0 <= 0xFF_FFFF {
            3
        } else {
            4
        }
    }

    /// 2-bit width code: width - 1.
    #[inline]
    pub fn flag_code(self) -> u8 {
        (self.encoded_len() - 1) as u8
    }

    /// Width in bytes for a 2-bit code.
    #[inline]
    pub fn width_from_code(code: u8) -> usize {
        (code & 0b11) as usize + 1
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_uint_le(self.0 as u64, self.encoded_len());
    }

    /// Decode exactly `width` little-endian bytes.
    pub fn decode(buf: &mut impl Buf, width: usize) -> Option<Self> {
        if buf.remaining() < width {
            return None;
        }
        Some(StreamId(buf.get_uint_le(width) as u32))
    }

    /// The next stream id for the same endpoint (same parity).
    #[inline]
    pub fn next(self) -> StreamId {
        StreamId(self.0.wrapping_add(2))
    }

    /// Odd ids belong to the initiating (client) side.
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Offset ─────────────────────────────────────────────────────────────────

/// A byte position within a stream, encoded in 0, 2, 3, 4, 5, 6 or 7 bytes.
///
/// Zero encodes to zero bytes (the flag code alone carries it). The wire
/// width bounds values at 2^56-1; callers should stay within 2^53, which
/// bounds the maximum representable stream size. That is a documented
/// limitation, not a silent truncation: `new` rejects anything wider than
/// 7 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u64);

impl Offset {
    /// Maximum wire-representable value: 2^56 - 1.
    pub const MAX: u64 = (1 << 56) - 1;

    pub const ZERO: Offset = Offset(0);

    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        if val <= Self::MAX {
            Some(Offset(val))
        } else {
            None
        }
    }

    /// Create from a u64, panicking if out of range.
    #[inline]
    pub fn from_u64(val: u64) -> Self {
        Self::new(val).expect("offset exceeds 56-bit wire limit")
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to: 0 or 2-7.
    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 == 0 {
            0
        } else if self.0 <= 0xFFFF {
            2
        } else if self.0 <= 0xFF_FFFF {
            3
        } else if self.0 <= 0xFFFF_FFFF {
            4
        } else if self.0 <= 0xFF_FFFF_FFFF {
            5
        } else if self.0 <= 0xFFFF_FFFF_FFFF {
            6
        } else {
            7
        }
    }

    /// 3-bit width code: 0 for absent, otherwise width - 1.
    #[inline]
    pub fn flag_code(self) -> u8 {
        match self.encoded_len() {
            0 => 0,
            n => (n - 1) as u8,
        }
    }

    /// Width in bytes for a 3-bit code: 0 stays 0, otherwise code + 1.
    #[inline]
    pub fn width_from_code(code: u8) -> usize {
        match code & 0b111 {
            0 => 0,
            c => c as usize + 1,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let len = self.encoded_len();
        if len > 0 {
            buf.put_uint_le(self.0, len);
        }
    }

    /// Decode exactly `width` little-endian bytes; width 0 yields 0.
    pub fn decode(buf: &mut impl Buf, width: usize) -> Option<Self> {
        if width == 0 {
            return Some(Offset(0));
        }
        if buf.remaining() < width {
            return None;
        }
        Some(Offset(buf.get_uint_le(width)))
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({})", self.0)
    }
}

// ─── Socket Address ─────────────────────────────────────────────────────────

/// Address family discriminant for IPv4.
pub const FAMILY_IPV4: u16 = 0x02;
/// Address family discriminant for IPv6.
pub const FAMILY_IPV6: u16 = 0x0a;

/// A socket address as carried in public reset packets (`CADR`).
///
/// Wire form: u16 LE family (0x02 or 0x0a), address octets in network
/// order (4 or 16 bytes), u16 LE port — 8 bytes total for IPv4, 20 for
/// IPv6. Textual parsing goes through the standard library, which expands
/// `::` zero-compression for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddress(pub SocketAddr);

impl SocketAddress {
    pub fn encoded_len(&self) -> usize {
        match self.0 {
            SocketAddr::V4(_) => 8,
            SocketAddr::V6(_) => 20,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.0 {
            SocketAddr::V4(addr) => {
                buf.put_u16_le(FAMILY_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16_le(addr.port());
            }
            SocketAddr::V6(addr) => {
                buf.put_u16_le(FAMILY_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16_le(addr.port());
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        match buf.get_u16_le() {
            FAMILY_IPV4 => {
                if buf.remaining() < 6 {
                    return None;
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16_le();
                Some(SocketAddress(SocketAddr::new(
                    IpAddr::from(octets),
                    port,
                )))
            }
            FAMILY_IPV6 => {
                if buf.remaining() < 18 {
                    return None;
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16_le();
                Some(SocketAddress(SocketAddr::new(
                    IpAddr::from(octets),
                    port,
                )))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        SocketAddress(addr)
    }
}

impl FromStr for SocketAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(SocketAddress)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn connection_id_roundtrip() {
        let id = ConnectionId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = BytesMut::new();
        id.encode(&mut buf);
        assert_eq!(buf.len(), ConnectionId::SIZE);
        let decoded = ConnectionId::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn connection_ids_are_random() {
        // Astronomically unlikely to collide.
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }

    #[test]
    fn packet_number_width_boundaries() {
        let cases: [(u64, usize, u8); 8] = [
            (1, 1, 0b00),
            (0xFF, 1, 0b00),
            (0x100, 2, 0b01),
            (0xFFFF, 2, 0b01),
            (0x1_0000, 4, 0b10),
            (0xFFFF_FFFF, 4, 0b10),
            (0x1_0000_0000, 6, 0b11),
            (PacketNumber::MAX, 6, 0b11),
        ];
        for (val, width, code) in cases {
            let pn = PacketNumber::from_u64(val);
            assert_eq!(pn.encoded_len(), width, "width for {val:#x}");
            assert_eq!(pn.flag_code(), code, "code for {val:#x}");
            let mut buf = BytesMut::new();
            pn.encode(&mut buf);
            assert_eq!(buf.len(), width);
            let decoded = PacketNumber::decode(&mut buf.freeze(), width).unwrap();
            assert_eq!(decoded, pn, "roundtrip for {val:#x}");
        }
    }

    #[test]
    fn packet_number_zero_rejected() {
        assert!(PacketNumber::new(0).is_none());
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        assert!(PacketNumber::decode(&mut buf.freeze(), 1).is_none());
    }

    #[test]
    fn packet_number_wraps_to_one() {
        let pn = PacketNumber::from_u64(PacketNumber::MAX);
        assert_eq!(pn.next().value(), 1);
        assert_eq!(PacketNumber::from_u64(41).next().value(), 42);
    }

    #[test]
    fn packet_number_reconstruct_same_epoch() {
        let reference = PacketNumber::from_u64(0x1_0234);
        let got = PacketNumber::reconstruct(0x35, 1, reference).unwrap();
        assert_eq!(got.value(), 0x1_0235);
    }

    #[test]
    fn packet_number_reconstruct_crosses_epoch_up() {
        // Reference near the top of its 2-byte epoch; a small truncated
        // value belongs to the next epoch.
        let reference = PacketNumber::from_u64(0x2_FFFE);
        let got = PacketNumber::reconstruct(0x0001, 2, reference).unwrap();
        assert_eq!(got.value(), 0x3_0001);
    }

    #[test]
    fn packet_number_reconstruct_crosses_epoch_down() {
        let reference = PacketNumber::from_u64(0x3_0001);
        let got = PacketNumber::reconstruct(0xFFFE, 2, reference).unwrap();
        assert_eq!(got.value(), 0x2_FFFE);
    }

    #[test]
    fn packet_number_reconstruct_full_width() {
        let reference = PacketNumber::from_u64(5);
        let got = PacketNumber::reconstruct(0x1234_5678_9ABC, 6, reference).unwrap();
        assert_eq!(got.value(), 0x1234_5678_9ABC);
    }

    #[test]
    fn stream_id_width_boundaries() {
        let cases: [(u32, usize); 8] = [
            (0, 1),
            (0xFF, 1),
            (0x100, 2),
            (0xFFFF, 2),
            (0x1_0000, 3),
            (0xFF_FFFF, 3),
            (0x100_0000, 4),
            (u32::MAX, 4),
        ];
        for (val, width) in cases {
            let id = StreamId::new(val);
            assert_eq!(id.encoded_len(), width, "width for {val:#x}");
            assert_eq!(StreamId::width_from_code(id.flag_code()), width);
            let mut buf = BytesMut::new();
            id.encode(&mut buf);
            let decoded = StreamId::decode(&mut buf.freeze(), width).unwrap();
            assert_eq!(decoded, id);
        }
    }

    #[test]
    fn stream_id_parity_allocation() {
        let mut id = StreamId::new(1);
        let mut seen = vec![id.value()];
        for _ in 0..3 {
            id = id.next();
            seen.push(id.value());
        }
        assert_eq!(seen, vec![1, 3, 5, 7]);
        assert!(StreamId::new(1).is_client_initiated());
        assert!(!StreamId::new(2).is_client_initiated());
    }

    #[test]
    fn offset_width_boundaries() {
        let cases: [(u64, usize, u8); 8] = [
            (0, 0, 0),
            (1, 2, 1),
            (0xFFFF, 2, 1),
            (0x1_0000, 3, 2),
            (0xFFFF_FFFF, 4, 3),
            (0x1_0000_0000, 5, 4),
            (0xFFFF_FFFF_FFFF, 6, 5),
            (Offset::MAX, 7, 6),
        ];
        for (val, width, code) in cases {
            let off = Offset::from_u64(val);
            assert_eq!(off.encoded_len(), width, "width for {val:#x}");
            assert_eq!(off.flag_code(), code, "code for {val:#x}");
            assert_eq!(Offset::width_from_code(code), width);
            let mut buf = BytesMut::new();
            off.encode(&mut buf);
            assert_eq!(buf.len(), width);
            let decoded = Offset::decode(&mut buf.freeze(), width).unwrap();
            assert_eq!(decoded, off);
        }
    }

    #[test]
    fn offset_rejects_oversized() {
        assert!(Offset::new(Offset::MAX + 1).is_none());
    }

    #[test]
    fn socket_address_ipv4_roundtrip() {
        let addr: SocketAddress = "192.168.1.10:4433".parse().unwrap();
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 0x00);
        let decoded = SocketAddress::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn socket_address_ipv6_roundtrip() {
        // Zero-compressed textual form expands through std parsing.
        let addr: SocketAddress = "[2001:db8::1]:443".parse().unwrap();
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), 20);
        assert_eq!(buf[0], 0x0a);
        let decoded = SocketAddress::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, addr);
        match decoded.0 {
            SocketAddr::V6(v6) => {
                assert_eq!(v6.ip().segments(), [0x2001, 0xdb8, 0, 0, 0, 0, 0, 1]);
            }
            _ => panic!("expected IPv6"),
        }
    }

    #[test]
    fn socket_address_unknown_family_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x99);
        buf.put_slice(&[0u8; 6]);
        assert!(SocketAddress::decode(&mut buf.freeze()).is_none());
    }
}
