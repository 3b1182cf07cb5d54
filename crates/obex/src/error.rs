//! Error types for the OBEX layer.

use crate::wire::ResponseCode;

/// Errors produced while encoding, decoding or exchanging packets.
#[derive(Debug, thiserror::Error)]
pub enum ObexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("packet of {0} bytes exceeds the negotiated maximum")]
    PacketTooLarge(usize),

    #[error("peer answered {0}")]
    Rejected(ResponseCode),

    #[error("transport closed")]
    Closed,
}

impl ObexError {
    /// Whether the error means the transport is gone rather than that a
    /// single exchange went wrong.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
