//! # Packet Codec
//!
//! Public-header parsing and the three packet variants.
//!
//! ## Public flags byte
//!
//! ```text
//! 0x01  VERSION       (client: version tag follows; server: negotiation packet)
//! 0x02  RESET         (public reset packet)
//! 0x04  auxiliary     (server: diversification nonce present;
//!                      client: second half of the full-connection-id form)
//! 0x08  CONNECTION_ID (full 8-byte id present — required)
//! 0x30  packet-number width code: 00=1, 01=2, 10=4, 11=6 bytes
//! 0x40  multipath     (must be 0)
//! 0x80  reserved      (must be 0)
//! ```
//!
//! Dispatch is role-aware: the same flags byte reads differently depending
//! on which side sent the datagram. Client-encoded regular packets use the
//! 0x0C full-connection-id form, so `0x1c` is the canonical no-version
//! client header with a 2-byte packet number.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{ErrorCode, Result, TransportError};
use crate::frame::Frame;
use crate::ids::{ConnectionId, PacketNumber, SocketAddress};

/// Inbound datagrams are truncated to this size before parsing, bounding
/// worst-case decode cost deterministically.
pub const MAX_RECEIVE_PACKET_SIZE: usize = 1452;

const FLAG_VERSION: u8 = 0x01;
const FLAG_RESET: u8 = 0x02;
const FLAG_AUX: u8 = 0x04;
const FLAG_CONNECTION_ID: u8 = 0x08;
const PACKET_NUMBER_SHIFT: u8 = 4;
const FLAG_MULTIPATH: u8 = 0x40;
const FLAG_RESERVED: u8 = 0x80;

// ─── Perspective ────────────────────────────────────────────────────────────

/// Which role an endpoint plays. Decoding needs the *sender's* perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// Initiating role: allocates odd stream ids starting at 1.
    Client,
    /// Listening role: allocates even stream ids starting at 0.
    Server,
}

impl Perspective {
    /// The opposite role.
    pub fn peer(self) -> Perspective {
        match self {
            Perspective::Client => Perspective::Server,
            Perspective::Server => Perspective::Client,
        }
    }

    /// First locally-allocated stream id for this role.
    pub fn initial_stream_id(self) -> u32 {
        match self {
            Perspective::Client => 1,
            Perspective::Server => 0,
        }
    }
}

// ─── Version ────────────────────────────────────────────────────────────────

/// A 4-byte ASCII protocol version tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(pub [u8; 4]);

impl Version {
    pub const K039: Version = Version(*b"K039");
    pub const K043: Version = Version(*b"K043");
    pub const K046: Version = Version(*b"K046");

    /// Locally supported versions, preference order.
    pub const SUPPORTED: [Version; 3] = [Version::K046, Version::K043, Version::K039];

    /// Default version a client offers.
    pub const DEFAULT: Version = Version::K046;

    pub fn is_supported(self) -> bool {
        Version::SUPPORTED.contains(&self)
    }

    pub fn encode(self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let mut tag = [0u8; 4];
        buf.copy_to_slice(&mut tag);
        Some(Version(tag))
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// Pick the first offered version in the local supported set.
///
/// Deterministic first-match over the *offered* list, not best-match.
pub fn choose_version(offered: &[Version]) -> Option<Version> {
    offered.iter().copied().find(|v| v.is_supported())
}

// ─── Diversification Nonce ──────────────────────────────────────────────────

/// 32-byte value the crypto collaborator uses to diversify per-connection
/// keys. Carried opaquely here.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DiversificationNonce(pub [u8; 32]);

impl fmt::Debug for DiversificationNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiversificationNonce(..)")
    }
}

// ─── Public Header ──────────────────────────────────────────────────────────

/// The validated leading flags byte plus connection id — enough for a
/// demultiplexer to route a datagram without parsing the body.
#[derive(Debug, Clone, Copy)]
pub struct PublicHeader {
    pub flags: u8,
    pub connection_id: ConnectionId,
}

impl PublicHeader {
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(TransportError::short(ErrorCode::INVALID_PACKET_HEADER, "flags"));
        }
        let flags = buf.get_u8();
        if flags & (FLAG_MULTIPATH | FLAG_RESERVED) != 0 {
            return Err(TransportError::new(
                ErrorCode::INVALID_PACKET_HEADER,
                "reserved flag bits set",
            ));
        }
        if flags & FLAG_CONNECTION_ID == 0 {
            return Err(TransportError::new(
                ErrorCode::INVALID_PACKET_HEADER,
                "full connection id bit missing",
            ));
        }
        let connection_id = ConnectionId::decode(buf).ok_or_else(|| {
            TransportError::short(ErrorCode::INVALID_PACKET_HEADER, "connection id")
        })?;
        Ok(PublicHeader {
            flags,
            connection_id,
        })
    }

    pub fn is_reset(&self) -> bool {
        self.flags & FLAG_RESET != 0
    }

    pub fn has_version(&self) -> bool {
        self.flags & FLAG_VERSION != 0
    }

    fn packet_number_width(&self) -> usize {
        PacketNumber::width_from_code(self.flags >> PACKET_NUMBER_SHIFT)
    }
}

// ─── Packet Variants ────────────────────────────────────────────────────────

/// A regular data-bearing packet.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularPacket {
    pub connection_id: ConnectionId,
    pub packet_number: PacketNumber,
    /// Version tag; carried only on client packets before negotiation
    /// completes.
    pub version: Option<Version>,
    /// Diversification nonce; carried only on server packets.
    pub nonce: Option<DiversificationNonce>,
    pub frames: Vec<Frame>,
}

/// An unencrypted public reset, authenticated only by connection id and
/// address match at the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetPacket {
    pub connection_id: ConnectionId,
    pub nonce_proof: [u8; 32],
    pub rejected_packet_number: PacketNumber,
    pub client_address: Option<SocketAddress>,
}

/// A server's version negotiation offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationPacket {
    pub connection_id: ConnectionId,
    pub versions: Vec<Version>,
}

/// Any parsed datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Regular(RegularPacket),
    Reset(ResetPacket),
    Negotiation(NegotiationPacket),
}

impl Packet {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Packet::Regular(p) => p.connection_id,
            Packet::Reset(p) => p.connection_id,
            Packet::Negotiation(p) => p.connection_id,
        }
    }

    /// Parse a complete datagram sent by `sender`.
    pub fn decode(buf: &mut impl Buf, sender: Perspective) -> Result<Packet> {
        let header = PublicHeader::decode(buf)?;
        if header.is_reset() {
            return ResetPacket::decode_body(header.connection_id, buf).map(Packet::Reset);
        }
        if header.has_version() && sender == Perspective::Server {
            return NegotiationPacket::decode_body(header.connection_id, buf)
                .map(Packet::Negotiation);
        }
        RegularPacket::decode_body(&header, buf, sender).map(Packet::Regular)
    }

    /// Serialize this packet as sent by `sender`.
    pub fn encode(&self, sender: Perspective) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(MAX_RECEIVE_PACKET_SIZE);
        match self {
            Packet::Regular(p) => p.encode(sender, &mut buf)?,
            Packet::Reset(p) => p.encode(&mut buf),
            Packet::Negotiation(p) => p.encode(&mut buf),
        }
        Ok(buf.freeze())
    }
}

impl RegularPacket {
    fn decode_body(header: &PublicHeader, buf: &mut impl Buf, sender: Perspective) -> Result<Self> {
        let version = if header.has_version() && sender == Perspective::Client {
            Some(Version::decode(buf).ok_or_else(|| {
                TransportError::short(ErrorCode::INVALID_PACKET_HEADER, "version tag")
            })?)
        } else {
            None
        };

        let nonce = if header.flags & FLAG_AUX != 0 && sender == Perspective::Server {
            if buf.remaining() < 32 {
                return Err(TransportError::short(
                    ErrorCode::INVALID_PACKET_HEADER,
                    "diversification nonce",
                ));
            }
            let mut bytes = [0u8; 32];
            buf.copy_to_slice(&mut bytes);
            Some(DiversificationNonce(bytes))
        } else {
            None
        };

        let width = header.packet_number_width();
        let packet_number = PacketNumber::decode(buf, width).ok_or_else(|| {
            TransportError::new(ErrorCode::INVALID_PACKET_HEADER, "bad packet number")
        })?;

        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::decode(buf)?);
        }

        Ok(RegularPacket {
            connection_id: header.connection_id,
            packet_number,
            version,
            nonce,
            frames,
        })
    }

    fn encode(&self, sender: Perspective, buf: &mut BytesMut) -> Result<()> {
        let mut flags = FLAG_CONNECTION_ID | (self.packet_number.flag_code() << PACKET_NUMBER_SHIFT);
        match sender {
            Perspective::Client => {
                // Full-connection-id form.
                flags |= FLAG_AUX;
                if self.version.is_some() {
                    flags |= FLAG_VERSION;
                }
            }
            Perspective::Server => {
                if self.nonce.is_some() {
                    flags |= FLAG_AUX;
                }
            }
        }
        buf.put_u8(flags);
        self.connection_id.encode(buf);
        if sender == Perspective::Client {
            if let Some(version) = self.version {
                version.encode(buf);
            }
        }
        if sender == Perspective::Server {
            if let Some(nonce) = &self.nonce {
                buf.put_slice(&nonce.0);
            }
        }
        self.packet_number.encode(buf);
        for frame in &self.frames {
            frame.encode(buf)?;
        }
        Ok(())
    }
}

impl ResetPacket {
    /// Body: `PRST`, then `RNON` + 32-byte proof, then `RSEQ` + 8-byte
    /// full packet number, then optionally `CADR` + socket address.
    /// Tag order is fixed; any mismatch rejects.
    fn decode_body(connection_id: ConnectionId, buf: &mut impl Buf) -> Result<Self> {
        expect_tag(buf, b"PRST")?;
        expect_tag(buf, b"RNON")?;
        if buf.remaining() < 32 {
            return Err(TransportError::short(
                ErrorCode::INVALID_PUBLIC_RESET_PACKET,
                "nonce proof",
            ));
        }
        let mut nonce_proof = [0u8; 32];
        buf.copy_to_slice(&mut nonce_proof);

        expect_tag(buf, b"RSEQ")?;
        if buf.remaining() < 8 {
            return Err(TransportError::short(
                ErrorCode::INVALID_PUBLIC_RESET_PACKET,
                "rejected packet number",
            ));
        }
        let rejected_packet_number = PacketNumber::new(buf.get_u64_le()).ok_or_else(|| {
            TransportError::new(
                ErrorCode::INVALID_PUBLIC_RESET_PACKET,
                "rejected packet number out of range",
            )
        })?;

        let client_address = if buf.has_remaining() {
            expect_tag(buf, b"CADR")?;
            Some(SocketAddress::decode(buf).ok_or_else(|| {
                TransportError::new(ErrorCode::INVALID_PUBLIC_RESET_PACKET, "bad client address")
            })?)
        } else {
            None
        };

        Ok(ResetPacket {
            connection_id,
            nonce_proof,
            rejected_packet_number,
            client_address,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(FLAG_RESET | FLAG_CONNECTION_ID);
        self.connection_id.encode(buf);
        buf.put_slice(b"PRST");
        buf.put_slice(b"RNON");
        buf.put_slice(&self.nonce_proof);
        buf.put_slice(b"RSEQ");
        buf.put_u64_le(self.rejected_packet_number.value());
        if let Some(addr) = &self.client_address {
            buf.put_slice(b"CADR");
            addr.encode(buf);
        }
    }
}

impl NegotiationPacket {
    /// Body: 4-byte ASCII version tags until the buffer is exhausted.
    fn decode_body(connection_id: ConnectionId, buf: &mut impl Buf) -> Result<Self> {
        let mut versions = Vec::new();
        while buf.has_remaining() {
            let version = Version::decode(buf).ok_or_else(|| {
                TransportError::short(ErrorCode::INVALID_NEGOTIATION_DATA, "version tag")
            })?;
            if !version.0.iter().all(|b| b.is_ascii_graphic()) {
                return Err(TransportError::new(
                    ErrorCode::INVALID_NEGOTIATION_DATA,
                    "version tag is not printable ASCII",
                ));
            }
            versions.push(version);
        }
        if versions.is_empty() {
            return Err(TransportError::new(
                ErrorCode::INVALID_NEGOTIATION_DATA,
                "no versions offered",
            ));
        }
        Ok(NegotiationPacket {
            connection_id,
            versions,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(FLAG_VERSION | FLAG_CONNECTION_ID);
        self.connection_id.encode(buf);
        for version in &self.versions {
            version.encode(buf);
        }
    }
}

/// Consume a fixed 4-byte tag, rejecting any mismatch.
fn expect_tag(buf: &mut impl Buf, expected: &[u8; 4]) -> Result<()> {
    if buf.remaining() < 4 {
        return Err(TransportError::short(
            ErrorCode::INVALID_PUBLIC_RESET_PACKET,
            "tag",
        ));
    }
    let mut tag = [0u8; 4];
    buf.copy_to_slice(&mut tag);
    if &tag != expected {
        return Err(TransportError::new(
            ErrorCode::INVALID_PUBLIC_RESET_PACKET,
            format!(
                "expected tag {}, got {}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&tag)
            ),
        ));
    }
    Ok(())
}
