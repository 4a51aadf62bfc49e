//! # Counters
//!
//! Monotonic counters exported as serializable snapshots. Collected
//! inline on the hot path; cheap enough to keep always-on.

use serde::Serialize;

/// Per-session counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub stream_bytes_received: u64,
    pub acks_received: u64,
    pub pings_received: u64,
    pub window_updates_received: u64,
    pub blocked_received: u64,
    pub congestion_feedback_received: u64,
}

impl SessionStats {
    /// Inbound datagrams discarded as a share of those seen.
    pub fn drop_ratio(&self) -> f64 {
        let seen = self.packets_received + self.packets_dropped;
        if seen == 0 {
            return 0.0;
        }
        self.packets_dropped as f64 / seen as f64
    }
}

/// Endpoint-wide counters, aggregated across sessions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointStats {
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub negotiation_packets_sent: u64,
}
