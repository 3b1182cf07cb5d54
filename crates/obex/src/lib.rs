//! OBEX object-push over any reliable byte stream.
//!
//! Only the subset needed for pushing objects is implemented: CONNECT,
//! PUT, ABORT and DISCONNECT, plus the headers that describe an object.
//! The client side is a lock-step request/response driver; the server
//! side is split into a [`RequestReader`] and a [`ResponseWriter`] so the
//! read half can be pumped from its own task.

pub mod client;
pub mod error;
pub mod headers;
pub mod server;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;
pub mod wire;

pub use client::ObexClient;
pub use error::ObexError;
pub use headers::HeaderSet;
pub use server::{Request, RequestReader, ResponseWriter, split_server};
pub use transport::{
    AcceptFuture, ConnectFuture, Connector, TcpConnector, TcpTransportListener, Transport,
    TransportIo, TransportListener,
};
pub use wire::{ConnectFields, Opcode, ResponseCode};

/// Protocol version sent in CONNECT (1.0).
pub const OBEX_VERSION: u8 = 0x10;

/// Largest packet this implementation offers.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 16 * 1024;

/// Smallest packet size a peer may negotiate.
pub const MIN_PACKET_SIZE: u16 = 255;
