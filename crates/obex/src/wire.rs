//! OBEX packet framing.
//!
//! # Wire format
//!
//! ```text
//! PACKET:   [1 byte: opcode or response code]
//!           [2 bytes BE: total packet length, including these 3 bytes]
//!           [CONNECT only: version u8, flags u8, max packet size u16 BE]
//!           [headers ...]
//! ```
//!
//! The high bit of a request opcode is the "final" bit. Responses always
//! carry it.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ObexError;
use crate::headers::HeaderSet;

pub const OPCODE_CONNECT: u8 = 0x80;
pub const OPCODE_DISCONNECT: u8 = 0x81;
pub const OPCODE_PUT: u8 = 0x02;
pub const OPCODE_PUT_FINAL: u8 = 0x82;
pub const OPCODE_ABORT: u8 = 0xFF;

/// Fixed prefix of every packet.
pub const PACKET_HEADER_LEN: usize = 3;

/// Extra fields carried by CONNECT requests and their responses.
pub const CONNECT_FIELDS_LEN: usize = 4;

/// Request opcodes understood by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Connect,
    Disconnect,
    Put { last: bool },
    Abort,
    Other(u8),
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            OPCODE_CONNECT => Self::Connect,
            OPCODE_DISCONNECT => Self::Disconnect,
            OPCODE_PUT => Self::Put { last: false },
            OPCODE_PUT_FINAL => Self::Put { last: true },
            OPCODE_ABORT => Self::Abort,
            other => Self::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Connect => OPCODE_CONNECT,
            Self::Disconnect => OPCODE_DISCONNECT,
            Self::Put { last: false } => OPCODE_PUT,
            Self::Put { last: true } => OPCODE_PUT_FINAL,
            Self::Abort => OPCODE_ABORT,
            Self::Other(b) => b,
        }
    }
}

/// Response code sent by the receiving side (final bit included).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    pub const CONTINUE: Self = Self(0x90);
    pub const OK: Self = Self(0xA0);
    pub const BAD_REQUEST: Self = Self(0xC0);
    pub const UNAUTHORIZED: Self = Self(0xC1);
    pub const FORBIDDEN: Self = Self(0xC3);
    pub const NOT_FOUND: Self = Self(0xC4);
    pub const NOT_ACCEPTABLE: Self = Self(0xC6);
    pub const LENGTH_REQUIRED: Self = Self(0xCB);
    pub const PRECONDITION_FAILED: Self = Self(0xCC);
    pub const ENTITY_TOO_LARGE: Self = Self(0xCD);
    pub const UNSUPPORTED_MEDIA_TYPE: Self = Self(0xCF);
    pub const INTERNAL_ERROR: Self = Self(0xD0);
    pub const NOT_IMPLEMENTED: Self = Self(0xD1);
    pub const SERVICE_UNAVAILABLE: Self = Self(0xD3);
    pub const DATABASE_FULL: Self = Self(0xE0);

    /// CONTINUE or OK.
    pub fn is_success(self) -> bool {
        self == Self::CONTINUE || self == Self::OK
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::CONTINUE => "CONTINUE",
            Self::OK => "OK",
            Self::BAD_REQUEST => "BAD_REQUEST",
            Self::UNAUTHORIZED => "UNAUTHORIZED",
            Self::FORBIDDEN => "FORBIDDEN",
            Self::NOT_FOUND => "NOT_FOUND",
            Self::NOT_ACCEPTABLE => "NOT_ACCEPTABLE",
            Self::LENGTH_REQUIRED => "LENGTH_REQUIRED",
            Self::PRECONDITION_FAILED => "PRECONDITION_FAILED",
            Self::ENTITY_TOO_LARGE => "ENTITY_TOO_LARGE",
            Self::UNSUPPORTED_MEDIA_TYPE => "UNSUPPORTED_MEDIA_TYPE",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
            Self::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
            Self::DATABASE_FULL => "DATABASE_FULL",
            _ => return None,
        })
    }
}

impl fmt::Debug for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Version, flags and maximum packet size exchanged during CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFields {
    pub version: u8,
    pub flags: u8,
    pub max_packet_size: u16,
}

impl ConnectFields {
    pub fn new(max_packet_size: u16) -> Self {
        Self {
            version: crate::OBEX_VERSION,
            flags: 0,
            max_packet_size,
        }
    }
}

/// A framed packet before its code is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: u8,
    pub connect: Option<ConnectFields>,
    pub headers: HeaderSet,
}

/// Encodes and writes one packet, then flushes.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u8,
    connect: Option<ConnectFields>,
    headers: &HeaderSet,
    max_packet_size: usize,
) -> Result<(), ObexError> {
    let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + CONNECT_FIELDS_LEN + headers.encoded_len());
    buf.push(code);
    buf.extend_from_slice(&[0, 0]);
    if let Some(fields) = connect {
        buf.push(fields.version);
        buf.push(fields.flags);
        buf.extend_from_slice(&fields.max_packet_size.to_be_bytes());
    }
    headers.encode(&mut buf)?;

    let total = buf.len();
    if total > max_packet_size || total > u16::MAX as usize {
        return Err(ObexError::PacketTooLarge(total));
    }
    buf[1..3].copy_from_slice(&(total as u16).to_be_bytes());

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one packet.
///
/// `has_connect_fields` tells whether the packet carries the CONNECT
/// fields. It receives the packet code, so request readers can decide
/// from the opcode while a client reading a CONNECT response passes
/// `|_| true`.
///
/// Returns `None` if the stream ends cleanly before the first byte.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    has_connect_fields: impl Fn(u8) -> bool,
) -> Result<Option<Packet>, ObexError> {
    let mut code = [0u8; 1];
    if reader.read(&mut code).await? == 0 {
        return Ok(None);
    }
    let code = code[0];
    let total = reader.read_u16().await? as usize;
    if total < PACKET_HEADER_LEN {
        return Err(ObexError::Protocol(format!(
            "packet length {total} shorter than its header"
        )));
    }

    let mut body = vec![0u8; total - PACKET_HEADER_LEN];
    reader.read_exact(&mut body).await?;

    let mut rest = &body[..];
    let connect = if has_connect_fields(code) {
        if rest.len() < CONNECT_FIELDS_LEN {
            return Err(ObexError::Protocol("truncated CONNECT fields".into()));
        }
        let fields = ConnectFields {
            version: rest[0],
            flags: rest[1],
            max_packet_size: u16::from_be_bytes([rest[2], rest[3]]),
        };
        rest = &rest[CONNECT_FIELDS_LEN..];
        Some(fields)
    } else {
        None
    };

    Ok(Some(Packet {
        code,
        connect,
        headers: HeaderSet::decode(rest)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_final_bit() {
        assert_eq!(Opcode::from_byte(0x02), Opcode::Put { last: false });
        assert_eq!(Opcode::from_byte(0x82), Opcode::Put { last: true });
        assert_eq!(Opcode::Put { last: true }.to_byte(), OPCODE_PUT_FINAL);
        assert_eq!(Opcode::from_byte(0x03), Opcode::Other(0x03));
    }

    #[test]
    fn response_code_names() {
        assert_eq!(ResponseCode::FORBIDDEN.to_string(), "FORBIDDEN");
        assert_eq!(ResponseCode(0xE5).to_string(), "0xE5");
        assert!(ResponseCode::CONTINUE.is_success());
        assert!(!ResponseCode::NOT_ACCEPTABLE.is_success());
    }

    #[tokio::test]
    async fn connect_packet_layout() {
        let headers = HeaderSet {
            count: Some(2),
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_packet(
            &mut buf,
            OPCODE_CONNECT,
            Some(ConnectFields::new(0x2000)),
            &headers,
            usize::MAX,
        )
        .await
        .unwrap();

        assert_eq!(
            buf,
            vec![0x80, 0x00, 0x0C, 0x10, 0x00, 0x20, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x02]
        );

        let mut cursor = &buf[..];
        let packet = read_packet(&mut cursor, |c| c == OPCODE_CONNECT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.connect, Some(ConnectFields::new(0x2000)));
        assert_eq!(packet.headers.count, Some(2));
    }

    #[tokio::test]
    async fn clean_eof_between_packets() {
        let mut cursor: &[u8] = &[];
        assert!(read_packet(&mut cursor, |_| false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_packet_is_an_error() {
        let mut cursor: &[u8] = &[0xA0, 0x00, 0x10, 0x01];
        let err = read_packet(&mut cursor, |_| false).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn oversized_packet_is_refused() {
        let headers = HeaderSet {
            body: Some(vec![0; 600]),
            ..Default::default()
        };
        let mut buf = Vec::new();
        let err = write_packet(&mut buf, OPCODE_PUT, None, &headers, 512)
            .await
            .unwrap_err();
        assert!(matches!(err, ObexError::PacketTooLarge(606)));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn bogus_length_is_rejected() {
        let mut cursor: &[u8] = &[0xA0, 0x00, 0x01];
        assert!(matches!(
            read_packet(&mut cursor, |_| false).await,
            Err(ObexError::Protocol(_))
        ));
    }
}
