//! # kestrel-quic
//!
//! Kestrel pure-Rust transport core.
//!
//! A gQUIC-style connection layer: little-endian wire codecs for packets
//! and frames, run-length ack compression, ordered stream multiplexing,
//! and per-connection session state machines, all free of sockets and
//! timers. Callers feed datagrams in and drain datagrams and events out.
//!
//! ## Crate structure
//!
//! - [`ids`] — Connection ids, packet numbers, stream ids, offsets,
//!   socket addresses
//! - [`frame`] — Frame type byte dispatch and per-kind codecs
//! - [`ack`] — Ack range compression and the ufloat16 delay encoding
//! - [`packet`] — Public header, regular/reset/negotiation packets,
//!   version choice
//! - [`stream`] — Per-stream reassembly and send chunking
//! - [`session`] — Per-connection state machine
//! - [`endpoint`] — Server-side connection demultiplexer
//! - [`error`] — Transport error codes
//! - [`stats`] — Serializable counters

pub mod ack;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod ids;
pub mod packet;
pub mod session;
pub mod stats;
pub mod stream;
