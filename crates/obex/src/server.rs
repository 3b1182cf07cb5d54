//! Server side of an OBEX connection.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::ObexError;
use crate::headers::HeaderSet;
use crate::wire::{ConnectFields, OPCODE_CONNECT, Opcode, ResponseCode, read_packet, write_packet};
use crate::{DEFAULT_MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub connect: Option<ConnectFields>,
    pub headers: HeaderSet,
}

/// Reads requests from the client.
pub struct RequestReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next request. `None` means the client closed the stream.
    ///
    /// Not cancel safe: dropping the future mid-packet loses framing.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ObexError> {
        let packet = read_packet(&mut self.reader, |code| code == OPCODE_CONNECT).await?;
        Ok(packet.map(|p| Request {
            opcode: Opcode::from_byte(p.code),
            connect: p.connect,
            headers: p.headers,
        }))
    }
}

/// Writes responses to the client.
pub struct ResponseWriter<W> {
    writer: W,
    max_packet: u16,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(writer: W, max_packet_size: u16) -> Self {
        Self {
            writer,
            max_packet: max_packet_size.max(MIN_PACKET_SIZE),
        }
    }

    /// Answers a CONNECT request, advertising our packet size.
    pub async fn respond_connect(&mut self, code: ResponseCode) -> Result<(), ObexError> {
        write_packet(
            &mut self.writer,
            code.0,
            Some(ConnectFields::new(self.max_packet)),
            &HeaderSet::new(),
            self.max_packet as usize,
        )
        .await
    }

    pub async fn respond(&mut self, code: ResponseCode) -> Result<(), ObexError> {
        self.respond_with(code, &HeaderSet::new()).await
    }

    pub async fn respond_with(
        &mut self,
        code: ResponseCode,
        headers: &HeaderSet,
    ) -> Result<(), ObexError> {
        write_packet(
            &mut self.writer,
            code.0,
            None,
            headers,
            self.max_packet as usize,
        )
        .await
    }

    pub async fn shutdown(&mut self) -> Result<(), ObexError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Splits a server transport into its request and response halves.
pub fn split_server<T: AsyncRead + AsyncWrite>(
    io: T,
    max_packet_size: u16,
) -> (RequestReader<ReadHalf<T>>, ResponseWriter<WriteHalf<T>>) {
    let (read, write) = tokio::io::split(io);
    (
        RequestReader::new(read),
        ResponseWriter::new(write, max_packet_size),
    )
}

/// [`split_server`] with the default packet size.
pub fn split_default<T: AsyncRead + AsyncWrite>(
    io: T,
) -> (RequestReader<ReadHalf<T>>, ResponseWriter<WriteHalf<T>>) {
    split_server(io, DEFAULT_MAX_PACKET_SIZE)
}
