//! # Session
//!
//! The per-connection state machine. A [`Session`] is pure logic: the
//! caller feeds inbound datagrams through [`Session::handle_datagram`],
//! drives sending with the write/flush operations, and drains encoded
//! datagrams and application events afterwards. No sockets, timers, or
//! threads live here.
//!
//! Lifecycle: `Initial` → (client sends) `VersionPending` → (first
//! regular packet from the peer) `Established` → `Closing` (local close)
//! or `Closed` (peer close, public reset, or fatal error).

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

use crate::ack::{AckFrame, AckRange};
use crate::error::{ErrorCode, Result, TransportError};
use crate::frame::Frame;
use crate::ids::{ConnectionId, PacketNumber, SocketAddress, StreamId};
use crate::packet::{
    choose_version, NegotiationPacket, Packet, Perspective, PublicHeader, RegularPacket, Version,
    MAX_RECEIVE_PACKET_SIZE,
};
use crate::stats::SessionStats;
use crate::stream::{Stream, DEFAULT_MAX_FRAME_PAYLOAD};

/// Frame bytes packed into one outgoing datagram, leaving headroom for
/// the public header, version tag, and packet number.
const PACKET_PAYLOAD_BUDGET: usize = MAX_RECEIVE_PACKET_SIZE - 48;

// ─── States and Events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing sent yet.
    Initial,
    /// Client has sent version-tagged packets and awaits the peer.
    VersionPending,
    /// Both sides agree on a version; data flows.
    Established,
    /// Local close sent; inbound traffic is still read for the peer's
    /// close confirmation.
    Closing,
    /// Terminal.
    Closed,
}

/// What the caller learns from a drain after feeding datagrams.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    VersionAgreed(Version),
    StreamData { stream_id: StreamId, data: Bytes },
    StreamFinished(StreamId),
    PingReceived,
    Closed { code: ErrorCode, reason: String },
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct Session {
    connection_id: ConnectionId,
    perspective: Perspective,
    state: SessionState,
    version: Version,
    version_negotiated: bool,
    /// Only the first negotiation packet is honored.
    negotiation_received: bool,
    goaway_received: bool,
    local_address: SocketAddress,
    peer_address: SocketAddress,
    next_packet_number: PacketNumber,
    largest_received: Option<PacketNumber>,
    /// Packet numbers received and not yet released by a STOP_WAITING.
    received: BTreeSet<u64>,
    ack_pending: bool,
    peer_largest_acked: Option<u64>,
    next_stream_id: StreamId,
    streams: HashMap<u32, Stream>,
    max_frame_payload: usize,
    events: Vec<SessionEvent>,
    output: VecDeque<Bytes>,
    stats: SessionStats,
}

impl Session {
    /// A client session with a fresh connection id, offering the default
    /// version.
    pub fn client(local_address: SocketAddress, peer_address: SocketAddress) -> Self {
        Session::new(
            ConnectionId::generate(),
            Perspective::Client,
            local_address,
            peer_address,
        )
    }

    /// A server session for a connection id learned from the first
    /// client datagram.
    pub fn server(
        connection_id: ConnectionId,
        local_address: SocketAddress,
        peer_address: SocketAddress,
    ) -> Self {
        Session::new(connection_id, Perspective::Server, local_address, peer_address)
    }

    fn new(
        connection_id: ConnectionId,
        perspective: Perspective,
        local_address: SocketAddress,
        peer_address: SocketAddress,
    ) -> Self {
        Session {
            connection_id,
            perspective,
            state: SessionState::Initial,
            version: Version::DEFAULT,
            version_negotiated: false,
            negotiation_received: false,
            goaway_received: false,
            local_address,
            peer_address,
            next_packet_number: PacketNumber::FIRST,
            largest_received: None,
            received: BTreeSet::new(),
            ack_pending: false,
            peer_largest_acked: None,
            next_stream_id: StreamId::new(perspective.initial_stream_id()),
            streams: HashMap::new(),
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            events: Vec::new(),
            output: VecDeque::new(),
            stats: SessionStats::default(),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn peer_address(&self) -> SocketAddress {
        self.peer_address
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Largest own packet number the peer has acknowledged.
    pub fn peer_largest_acked(&self) -> Option<u64> {
        self.peer_largest_acked
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    // ─── Application Surface ────────────────────────────────────────────

    /// Open a locally-initiated stream.
    pub fn open_stream(&mut self) -> Result<StreamId> {
        self.check_open()?;
        if self.goaway_received {
            return Err(TransportError::new(
                ErrorCode::PEER_GOING_AWAY,
                "peer is going away, no new streams",
            ));
        }
        let id = self.next_stream_id;
        self.next_stream_id = id.next();
        self.streams.insert(id.value(), Stream::new(id));
        Ok(id)
    }

    /// Queue stream data. Nothing hits the wire until [`Session::flush`].
    pub fn write(&mut self, stream_id: StreamId, data: Bytes) -> Result<()> {
        self.check_open()?;
        let stream = self.streams.get_mut(&stream_id.value()).ok_or_else(|| {
            TransportError::new(ErrorCode::INVALID_STREAM_ID, "write to unknown stream")
        })?;
        stream.write(data)
    }

    /// Mark a stream done; its FIN rides the next flush.
    pub fn finish_stream(&mut self, stream_id: StreamId) -> Result<()> {
        self.check_open()?;
        let stream = self.streams.get_mut(&stream_id.value()).ok_or_else(|| {
            TransportError::new(ErrorCode::INVALID_STREAM_ID, "finish of unknown stream")
        })?;
        stream.finish();
        Ok(())
    }

    /// Send a PING immediately.
    pub fn ping(&mut self) -> Result<()> {
        self.check_open()?;
        self.send_frames(vec![Frame::Ping])
    }

    /// Initiate a graceful close. The session enters `Closing` and keeps
    /// reading until the peer confirms or the caller discards it.
    pub fn close(&mut self, code: ErrorCode, reason: &str) -> Result<()> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Ok(());
        }
        self.send_frames(vec![Frame::ConnectionClose {
            error_code: code,
            reason: reason.to_string(),
        }])?;
        self.state = SessionState::Closing;
        Ok(())
    }

    /// Package pending acknowledgements and queued stream data into
    /// datagrams.
    pub fn flush(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Ok(());
        }
        let mut frames = Vec::new();
        if self.ack_pending {
            if let Some(ack) = self.build_ack() {
                frames.push(Frame::Ack(ack));
            }
            self.ack_pending = false;
        }
        let mut ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.has_pending_send())
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(stream) = self.streams.get_mut(&id) {
                frames.extend(stream.flush(self.max_frame_payload).into_iter().map(Frame::Stream));
            }
        }
        if frames.is_empty() {
            return Ok(());
        }

        // Greedy packing against the per-datagram budget.
        let mut batch = Vec::new();
        let mut batch_len = 0usize;
        for frame in frames {
            let len = encoded_frame_len(&frame)?;
            if batch_len + len > PACKET_PAYLOAD_BUDGET && !batch.is_empty() {
                self.send_frames(std::mem::take(&mut batch))?;
                batch_len = 0;
            }
            batch_len += len;
            batch.push(frame);
        }
        if !batch.is_empty() {
            self.send_frames(batch)?;
        }
        Ok(())
    }

    pub fn drain_output(&mut self) -> Vec<Bytes> {
        self.output.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn check_open(&self) -> Result<()> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Err(TransportError::new(
                ErrorCode::CONNECTION_CLOSED,
                "session is closing or closed",
            ));
        }
        Ok(())
    }

    // ─── Sending ────────────────────────────────────────────────────────

    fn send_frames(&mut self, frames: Vec<Frame>) -> Result<()> {
        if self.state == SessionState::Closed || frames.is_empty() {
            return Ok(());
        }
        let packet_number = self.next_packet_number;
        self.next_packet_number = packet_number.next();

        // Clients tag every packet with the offered version until the
        // peer's first regular packet confirms it.
        let version = if self.perspective == Perspective::Client && !self.version_negotiated {
            Some(self.version)
        } else {
            None
        };

        self.stats.frames_sent += frames.len() as u64;
        let packet = Packet::Regular(RegularPacket {
            connection_id: self.connection_id,
            packet_number,
            version,
            nonce: None,
            frames,
        });
        let bytes = packet.encode(self.perspective)?;
        debug!(
            connection_id = %self.connection_id,
            packet_number = packet_number.value(),
            len = bytes.len(),
            "sending packet"
        );
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        self.output.push_back(bytes);

        if self.perspective == Perspective::Client && self.state == SessionState::Initial {
            self.state = SessionState::VersionPending;
        }
        Ok(())
    }

    /// Close with a protocol error: tell the peer, surface an event, and
    /// go terminal.
    fn fatal_close(&mut self, code: ErrorCode, reason: String) {
        if self.state == SessionState::Closed {
            return;
        }
        warn!(connection_id = %self.connection_id, %code, reason, "fatal close");
        if let Err(err) = self.send_frames(vec![Frame::ConnectionClose {
            error_code: code,
            reason: reason.clone(),
        }]) {
            warn!(connection_id = %self.connection_id, error = %err, "close frame not sent");
        }
        self.state = SessionState::Closed;
        self.events.push(SessionEvent::Closed { code, reason });
    }

    fn build_ack(&self) -> Option<AckFrame> {
        let largest = *self.received.iter().next_back()?;
        let lowest = *self.received.iter().next()?;
        // Collapse the received set into descending ranges.
        let mut ranges: Vec<AckRange> = Vec::new();
        for &n in self.received.iter().rev() {
            match ranges.last_mut() {
                Some(range) if range.first == n + 1 => range.first = n,
                _ => ranges.push(AckRange::new(n, n)),
            }
        }
        if ranges.len() == 1 {
            Some(AckFrame::contiguous(lowest, largest, 0))
        } else {
            Some(AckFrame::with_ranges(0, ranges))
        }
    }

    // ─── Receiving ──────────────────────────────────────────────────────

    /// Feed one inbound datagram received from `from`. Oversized input is
    /// truncated before parsing. A foreign connection id or a malformed
    /// header drops the datagram; malformed frames on a matching
    /// connection kill the session.
    pub fn handle_datagram(&mut self, from: SocketAddress, datagram: &[u8]) {
        if self.state == SessionState::Closed {
            self.stats.packets_dropped += 1;
            return;
        }
        let len = datagram.len().min(MAX_RECEIVE_PACKET_SIZE);
        let datagram = &datagram[..len];

        // Identify the datagram before trusting anything in its body. An
        // off-path sender must not be able to kill the session by pairing
        // a foreign connection id with a mangled payload.
        let header = match PublicHeader::decode(&mut &*datagram) {
            Ok(header) => header,
            Err(err) => {
                debug!(connection_id = %self.connection_id, error = %err, "dropping datagram");
                self.stats.packets_dropped += 1;
                return;
            }
        };
        if header.connection_id != self.connection_id {
            debug!(
                connection_id = %self.connection_id,
                got = %header.connection_id,
                "connection id mismatch, dropping"
            );
            self.stats.packets_dropped += 1;
            return;
        }

        match Packet::decode(&mut &*datagram, self.perspective.peer()) {
            Ok(packet) => self.handle_packet(from, packet, len),
            Err(err) => {
                if is_droppable(err.code) {
                    debug!(connection_id = %self.connection_id, error = %err, "dropping datagram");
                    self.stats.packets_dropped += 1;
                } else {
                    self.fatal_close(err.code, err.detail);
                }
            }
        }
    }

    fn handle_packet(&mut self, from: SocketAddress, packet: Packet, len: usize) {
        match packet {
            Packet::Reset(reset) => {
                // A reset is only honored from the remembered peer
                // address, and the address echo, when present, must match
                // our own address. Anything else is off-path spoofing.
                if from != self.peer_address {
                    debug!(
                        connection_id = %self.connection_id,
                        %from,
                        "reset from unexpected source, dropping"
                    );
                    self.stats.packets_dropped += 1;
                    return;
                }
                if let Some(addr) = reset.client_address {
                    if addr != self.local_address {
                        debug!(connection_id = %self.connection_id, "reset address mismatch, dropping");
                        self.stats.packets_dropped += 1;
                        return;
                    }
                }
                debug!(
                    connection_id = %self.connection_id,
                    rejected = reset.rejected_packet_number.value(),
                    "public reset received"
                );
                self.state = SessionState::Closed;
                self.events.push(SessionEvent::Closed {
                    code: ErrorCode::PUBLIC_RESET,
                    reason: "public reset from peer".to_string(),
                });
            }
            Packet::Negotiation(negotiation) => self.handle_negotiation(negotiation),
            Packet::Regular(regular) => self.handle_regular(regular, len),
        }
    }

    fn handle_negotiation(&mut self, negotiation: NegotiationPacket) {
        if self.perspective == Perspective::Server {
            self.stats.packets_dropped += 1;
            return;
        }
        if self.version_negotiated || self.negotiation_received {
            self.stats.packets_dropped += 1;
            return;
        }
        // A genuine negotiation never lists the version we offered; one
        // that does is stale or forged.
        if negotiation.versions.contains(&self.version) {
            debug!(connection_id = %self.connection_id, "negotiation lists our own offer, dropping");
            self.stats.packets_dropped += 1;
            return;
        }
        match choose_version(&negotiation.versions) {
            Some(version) => {
                debug!(connection_id = %self.connection_id, %version, "switching version");
                self.negotiation_received = true;
                self.version = version;
            }
            None => {
                self.fatal_close(
                    ErrorCode::VERSION_NEGOTIATION_MISMATCH,
                    "no mutually supported version".to_string(),
                );
            }
        }
    }

    fn handle_regular(&mut self, packet: RegularPacket, len: usize) {
        if !self.version_negotiated {
            match self.perspective {
                Perspective::Client => {
                    // Any regular packet from the server confirms the
                    // version currently offered.
                    self.version_negotiated = true;
                    self.state = SessionState::Established;
                    self.events.push(SessionEvent::VersionAgreed(self.version));
                }
                Perspective::Server => match packet.version {
                    Some(version) if version.is_supported() => {
                        self.version = version;
                        self.version_negotiated = true;
                        self.state = SessionState::Established;
                        self.events.push(SessionEvent::VersionAgreed(version));
                    }
                    _ => {
                        // Unsupported or missing tag; the endpoint answers
                        // unsupported offers with a negotiation packet.
                        self.stats.packets_dropped += 1;
                        return;
                    }
                },
            }
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += len as u64;
        let packet_number = packet.packet_number;
        self.received.insert(packet_number.value());
        // Ack-only and padding-only packets are not themselves acked,
        // otherwise two idle peers would trade acks forever.
        if packet.frames.iter().any(is_retransmittable) {
            self.ack_pending = true;
        }
        if self.largest_received.map_or(true, |n| packet_number.value() > n.value()) {
            self.largest_received = Some(packet_number);
        }

        for frame in packet.frames {
            self.stats.frames_received += 1;
            if let Err(err) = self.dispatch_frame(frame, packet_number) {
                self.fatal_close(err.code, err.detail);
                return;
            }
        }
    }

    fn dispatch_frame(&mut self, frame: Frame, packet_number: PacketNumber) -> Result<()> {
        match frame {
            Frame::Padding => {}
            Frame::Stream(stream_frame) => {
                let id = stream_frame.stream_id;
                if !self.streams.contains_key(&id.value()) {
                    let peer_initiated =
                        id.is_client_initiated() == (self.perspective == Perspective::Server);
                    if !peer_initiated {
                        return Err(TransportError::new(
                            ErrorCode::INVALID_STREAM_ID,
                            format!("data on unopened local stream {}", id.value()),
                        ));
                    }
                    self.streams.insert(id.value(), Stream::new(id));
                }
                self.stats.stream_bytes_received += stream_frame.data.len() as u64;
                let stream = self.streams.get_mut(&id.value()).ok_or_else(|| {
                    TransportError::new(ErrorCode::INTERNAL_ERROR, "stream vanished")
                })?;
                stream.receive_frame(&stream_frame)?;
                for data in stream.read() {
                    self.events.push(SessionEvent::StreamData {
                        stream_id: id,
                        data,
                    });
                }
                if stream.take_finished() {
                    self.events.push(SessionEvent::StreamFinished(id));
                }
            }
            Frame::Ack(ack) => {
                if !ack.validate_ranges() {
                    return Err(TransportError::new(
                        ErrorCode::INVALID_ACK_DATA,
                        "malformed ack range structure",
                    ));
                }
                self.stats.acks_received += 1;
                if self.peer_largest_acked.map_or(true, |n| ack.largest_acked > n) {
                    self.peer_largest_acked = Some(ack.largest_acked);
                }
            }
            Frame::Ping => {
                self.stats.pings_received += 1;
                self.events.push(SessionEvent::PingReceived);
            }
            Frame::ConnectionClose { error_code, reason } => {
                debug!(connection_id = %self.connection_id, code = %error_code, "peer closed");
                self.state = SessionState::Closed;
                self.events.push(SessionEvent::Closed {
                    code: error_code,
                    reason,
                });
            }
            Frame::GoAway { .. } => {
                self.goaway_received = true;
            }
            Frame::RstStream { stream_id, .. } => {
                self.streams.remove(&stream_id.value());
            }
            Frame::WindowUpdate { .. } => {
                self.stats.window_updates_received += 1;
            }
            Frame::Blocked { .. } => {
                self.stats.blocked_received += 1;
            }
            Frame::StopWaiting { least_unacked_delta } => {
                if least_unacked_delta >= packet_number.value() {
                    return Err(TransportError::new(
                        ErrorCode::INVALID_STOP_WAITING_DATA,
                        "least-unacked delta reaches below the first packet",
                    ));
                }
                let least_unacked = packet_number.value() - least_unacked_delta;
                // The peer will not retransmit below this; stop reporting
                // those packets in our acks.
                self.received.retain(|&n| n >= least_unacked);
            }
            Frame::CongestionFeedback => {
                self.stats.congestion_feedback_received += 1;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("perspective", &self.perspective)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

/// Header-class parse failures drop the datagram; everything else is a
/// session-fatal protocol violation.
fn is_droppable(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::INVALID_PACKET_HEADER
            | ErrorCode::INVALID_PUBLIC_RESET_PACKET
            | ErrorCode::INVALID_NEGOTIATION_DATA
    )
}

/// Frames the sender would have to retransmit on loss. Receipt of any of
/// these obliges an acknowledgement.
fn is_retransmittable(frame: &Frame) -> bool {
    !matches!(
        frame,
        Frame::Ack(_) | Frame::Padding | Frame::StopWaiting { .. }
    )
}

fn encoded_frame_len(frame: &Frame) -> Result<usize> {
    let mut scratch = BytesMut::new();
    frame.encode(&mut scratch)?;
    Ok(scratch.len())
}
