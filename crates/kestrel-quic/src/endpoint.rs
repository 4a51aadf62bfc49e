//! # Endpoint
//!
//! Server-side demultiplexer. Routes inbound datagrams to sessions by
//! connection id, answers unknown clients offering an unsupported
//! version with a negotiation packet, and creates server sessions for
//! the rest. Like [`Session`], this is pure logic: the caller owns the
//! socket and shuttles `(address, bytes)` pairs in and out.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::ids::{ConnectionId, SocketAddress};
use crate::packet::{
    NegotiationPacket, Packet, Perspective, PublicHeader, Version, MAX_RECEIVE_PACKET_SIZE,
};
use crate::session::Session;
use crate::stats::EndpointStats;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Cap applied to each inbound datagram before parsing.
    pub max_receive_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            max_receive_size: MAX_RECEIVE_PACKET_SIZE,
        }
    }
}

pub struct Endpoint {
    config: EndpointConfig,
    local_address: SocketAddress,
    sessions: HashMap<ConnectionId, Session>,
    output: VecDeque<(SocketAddress, Bytes)>,
    stats: EndpointStats,
}

impl Endpoint {
    pub fn new(local_address: SocketAddress, config: EndpointConfig) -> Self {
        Endpoint {
            config,
            local_address,
            sessions: HashMap::new(),
            output: VecDeque::new(),
            stats: EndpointStats::default(),
        }
    }

    pub fn local_address(&self) -> SocketAddress {
        self.local_address
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_mut(&mut self, connection_id: &ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(connection_id)
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Route one inbound datagram.
    pub fn handle_datagram(&mut self, from: SocketAddress, datagram: &[u8]) {
        self.stats.datagrams_received += 1;
        let len = datagram.len().min(self.config.max_receive_size);
        let datagram = &datagram[..len];

        let header = match PublicHeader::decode(&mut &*datagram) {
            Ok(header) => header,
            Err(err) => {
                debug!(%from, error = %err, "undecodable public header, dropping");
                self.stats.datagrams_dropped += 1;
                return;
            }
        };

        if let Some(session) = self.sessions.get_mut(&header.connection_id) {
            session.handle_datagram(from, datagram);
            return;
        }
        self.accept(from, header.connection_id, datagram);
    }

    /// First datagram for an unknown connection id.
    fn accept(&mut self, from: SocketAddress, connection_id: ConnectionId, datagram: &[u8]) {
        let packet = match Packet::decode(&mut &*datagram, Perspective::Client) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%from, error = %err, "undecodable first datagram, dropping");
                self.stats.datagrams_dropped += 1;
                return;
            }
        };
        let offered = match &packet {
            Packet::Regular(p) => p.version,
            _ => {
                // Resets and negotiation packets for unknown connections
                // have nothing to act on.
                debug!(%from, %connection_id, "non-regular packet for unknown connection");
                self.stats.datagrams_dropped += 1;
                return;
            }
        };
        match offered {
            Some(version) if version.is_supported() => {}
            Some(version) => {
                debug!(%from, %connection_id, %version, "offering negotiation");
                let reply = Packet::Negotiation(NegotiationPacket {
                    connection_id,
                    versions: Version::SUPPORTED.to_vec(),
                });
                match reply.encode(Perspective::Server) {
                    Ok(bytes) => {
                        self.stats.negotiation_packets_sent += 1;
                        self.output.push_back((from, bytes));
                    }
                    Err(err) => {
                        debug!(error = %err, "negotiation packet not encoded");
                    }
                }
                return;
            }
            None => {
                // A first packet must carry the client's offer.
                debug!(%from, %connection_id, "first packet without version, dropping");
                self.stats.datagrams_dropped += 1;
                return;
            }
        }

        debug!(%from, %connection_id, "creating session");
        self.stats.sessions_created += 1;
        let mut session = Session::server(connection_id, self.local_address, from);
        session.handle_datagram(from, datagram);
        self.sessions.insert(connection_id, session);
    }

    /// Flush every session's pending acks and stream data.
    pub fn flush(&mut self) {
        for session in self.sessions.values_mut() {
            if let Err(err) = session.flush() {
                debug!(connection_id = %session.connection_id(), error = %err, "flush failed");
            }
        }
    }

    /// Collect all outbound datagrams, negotiation replies included.
    pub fn drain_output(&mut self) -> Vec<(SocketAddress, Bytes)> {
        for session in self.sessions.values_mut() {
            let to = session.peer_address();
            for bytes in session.drain_output() {
                self.output.push_back((to, bytes));
            }
        }
        self.output.drain(..).collect()
    }

    /// Drop terminal sessions, returning their connection ids.
    pub fn reap_closed(&mut self) -> Vec<ConnectionId> {
        let closed: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_closed())
            .map(|(&id, _)| id)
            .collect();
        for id in &closed {
            self.sessions.remove(id);
            self.stats.sessions_closed += 1;
        }
        closed
    }
}
