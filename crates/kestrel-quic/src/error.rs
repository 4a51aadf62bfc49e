//! # Error Taxonomy
//!
//! Wire-level protocol errors carry a numeric code from a fixed catalog
//! (code → symbolic name → human message). The same codes travel inside
//! CONNECTION_CLOSE, GOAWAY and RST_STREAM frames, so the catalog is kept
//! open: unknown codes received from a peer are preserved verbatim and
//! render as `UNKNOWN_ERROR`.
//!
//! Two propagation classes exist above this module:
//!
//! - **droppable** — malformed or spoofed datagrams; silently discarded
//! - **fatal** — invariant violations inside an identified session; close
//!   the session carrying the code to the peer

use std::fmt;

// ─── Error Codes ────────────────────────────────────────────────────────────

/// A protocol error code as carried on the wire (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(1);
    pub const INVALID_PACKET_HEADER: ErrorCode = ErrorCode(2);
    pub const INVALID_FRAME_DATA: ErrorCode = ErrorCode(3);
    pub const INVALID_ACK_DATA: ErrorCode = ErrorCode(4);
    pub const INVALID_STREAM_DATA: ErrorCode = ErrorCode(5);
    pub const INVALID_RST_STREAM_DATA: ErrorCode = ErrorCode(6);
    pub const INVALID_CONNECTION_CLOSE_DATA: ErrorCode = ErrorCode(7);
    pub const INVALID_GOAWAY_DATA: ErrorCode = ErrorCode(8);
    pub const INVALID_WINDOW_UPDATE_DATA: ErrorCode = ErrorCode(9);
    pub const INVALID_BLOCKED_DATA: ErrorCode = ErrorCode(10);
    pub const INVALID_STOP_WAITING_DATA: ErrorCode = ErrorCode(11);
    pub const INVALID_NEGOTIATION_DATA: ErrorCode = ErrorCode(12);
    pub const INVALID_PUBLIC_RESET_PACKET: ErrorCode = ErrorCode(13);
    pub const INVALID_VERSION: ErrorCode = ErrorCode(14);
    pub const VERSION_NEGOTIATION_MISMATCH: ErrorCode = ErrorCode(15);
    pub const PUBLIC_RESET: ErrorCode = ErrorCode(16);
    pub const INVALID_STREAM_ID: ErrorCode = ErrorCode(17);
    pub const PEER_GOING_AWAY: ErrorCode = ErrorCode(18);
    pub const CONNECTION_CLOSED: ErrorCode = ErrorCode(19);

    /// Symbolic name for this code.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "NO_ERROR",
            1 => "INTERNAL_ERROR",
            2 => "INVALID_PACKET_HEADER",
            3 => "INVALID_FRAME_DATA",
            4 => "INVALID_ACK_DATA",
            5 => "INVALID_STREAM_DATA",
            6 => "INVALID_RST_STREAM_DATA",
            7 => "INVALID_CONNECTION_CLOSE_DATA",
            8 => "INVALID_GOAWAY_DATA",
            9 => "INVALID_WINDOW_UPDATE_DATA",
            10 => "INVALID_BLOCKED_DATA",
            11 => "INVALID_STOP_WAITING_DATA",
            12 => "INVALID_NEGOTIATION_DATA",
            13 => "INVALID_PUBLIC_RESET_PACKET",
            14 => "INVALID_VERSION",
            15 => "VERSION_NEGOTIATION_MISMATCH",
            16 => "PUBLIC_RESET",
            17 => "INVALID_STREAM_ID",
            18 => "PEER_GOING_AWAY",
            19 => "CONNECTION_CLOSED",
            _ => "UNKNOWN_ERROR",
        }
    }

    /// Human-readable message for this code.
    pub fn message(self) -> &'static str {
        match self.0 {
            0 => "no error",
            1 => "internal error",
            2 => "malformed public packet header",
            3 => "malformed frame data",
            4 => "malformed or inconsistent ACK ranges",
            5 => "malformed STREAM frame data",
            6 => "malformed RST_STREAM frame",
            7 => "malformed CONNECTION_CLOSE frame",
            8 => "malformed GOAWAY frame",
            9 => "malformed WINDOW_UPDATE frame",
            10 => "malformed BLOCKED frame",
            11 => "malformed STOP_WAITING frame",
            12 => "malformed version negotiation packet",
            13 => "malformed public reset packet",
            14 => "unsupported protocol version",
            15 => "no common version with peer",
            16 => "session terminated by public reset",
            17 => "invalid stream id",
            18 => "peer going away",
            19 => "operation on a closed session",
            _ => "unknown error code",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

// ─── Transport Error ────────────────────────────────────────────────────────

/// A typed protocol error: taxonomy code plus context detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct TransportError {
    /// Taxonomy code (carried on the wire when the session closes).
    pub code: ErrorCode,
    /// Context for logs; never parsed.
    pub detail: String,
}

impl TransportError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        TransportError {
            code,
            detail: detail.into(),
        }
    }

    /// Shorthand for truncated-buffer failures during decode.
    pub fn short(code: ErrorCode, what: &str) -> Self {
        TransportError::new(code, format!("buffer too short for {what}"))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        assert_eq!(ErrorCode::NO_ERROR.name(), "NO_ERROR");
        assert_eq!(ErrorCode::PUBLIC_RESET.0, 16);
        assert_eq!(
            ErrorCode::VERSION_NEGOTIATION_MISMATCH.message(),
            "no common version with peer"
        );
    }

    #[test]
    fn unknown_code_preserved() {
        let code = ErrorCode(0xDEAD);
        assert_eq!(code.name(), "UNKNOWN_ERROR");
        assert_eq!(code.0, 0xDEAD);
    }

    #[test]
    fn display_includes_code_and_detail() {
        let err = TransportError::new(ErrorCode::INVALID_FRAME_DATA, "bad type byte 0x0a");
        let text = err.to_string();
        assert!(text.contains("INVALID_FRAME_DATA"));
        assert!(text.contains("bad type byte"));
    }
}
