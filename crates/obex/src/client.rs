//! Lock-step OBEX client.
//!
//! Each call writes one request packet and waits for the matching
//! response. Streaming an object is a sequence of [`ObexClient::request`]
//! calls driven by the caller, which keeps cancellation and progress
//! reporting out of this layer.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ObexError;
use crate::headers::{HeaderSet, VAR_HEADER_OVERHEAD};
use crate::wire::{
    ConnectFields, OPCODE_ABORT, OPCODE_CONNECT, OPCODE_DISCONNECT, Opcode, PACKET_HEADER_LEN,
    ResponseCode, read_packet, write_packet,
};
use crate::{DEFAULT_MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// Client end of an OBEX connection.
pub struct ObexClient<T> {
    io: T,
    local_max_packet: u16,
    max_packet: u16,
    connection_id: Option<u32>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ObexClient<T> {
    pub fn new(io: T) -> Self {
        Self::with_max_packet_size(io, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Offers `max_packet_size` during CONNECT.
    pub fn with_max_packet_size(io: T, max_packet_size: u16) -> Self {
        let size = max_packet_size.max(MIN_PACKET_SIZE);
        Self {
            io,
            local_max_packet: size,
            // Until CONNECT completes only the minimum is safe.
            max_packet: MIN_PACKET_SIZE,
            connection_id: None,
        }
    }

    /// Negotiated maximum packet size.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet as usize
    }

    /// Largest body chunk that fits in one packet next to `headers`.
    pub fn max_body_size(&self, headers: &HeaderSet) -> usize {
        let mut fixed = PACKET_HEADER_LEN + VAR_HEADER_OVERHEAD + headers.encoded_len();
        if self.connection_id.is_some() && headers.connection_id.is_none() {
            fixed += 5;
        }
        self.max_packet_size().saturating_sub(fixed)
    }

    /// Sends CONNECT and negotiates the packet size.
    pub async fn connect(&mut self, headers: HeaderSet) -> Result<ResponseCode, ObexError> {
        write_packet(
            &mut self.io,
            OPCODE_CONNECT,
            Some(ConnectFields::new(self.local_max_packet)),
            &headers,
            self.local_max_packet as usize,
        )
        .await?;

        let packet = read_packet(&mut self.io, |_| true)
            .await?
            .ok_or(ObexError::Closed)?;
        let code = ResponseCode(packet.code);
        if code == ResponseCode::OK {
            let remote = packet
                .connect
                .map(|f| f.max_packet_size)
                .unwrap_or(MIN_PACKET_SIZE);
            self.max_packet = remote.clamp(MIN_PACKET_SIZE, self.local_max_packet);
            self.connection_id = packet.headers.connection_id;
            debug!(max_packet = self.max_packet, "OBEX connected");
        }
        Ok(code)
    }

    /// Sends one request packet and returns the peer's response.
    pub async fn request(
        &mut self,
        opcode: Opcode,
        mut headers: HeaderSet,
    ) -> Result<(ResponseCode, HeaderSet), ObexError> {
        if headers.connection_id.is_none() {
            headers.connection_id = self.connection_id;
        }
        let max = self.max_packet_size();
        write_packet(&mut self.io, opcode.to_byte(), None, &headers, max).await?;

        let packet = read_packet(&mut self.io, |_| false)
            .await?
            .ok_or(ObexError::Closed)?;
        Ok((ResponseCode(packet.code), packet.headers))
    }

    /// Aborts the operation in progress.
    pub async fn abort(&mut self) -> Result<ResponseCode, ObexError> {
        let (code, _) = self
            .request(Opcode::from_byte(OPCODE_ABORT), HeaderSet::new())
            .await?;
        Ok(code)
    }

    /// Ends the OBEX session. The transport stays open.
    pub async fn disconnect(&mut self) -> Result<ResponseCode, ObexError> {
        let (code, _) = self
            .request(Opcode::from_byte(OPCODE_DISCONNECT), HeaderSet::new())
            .await?;
        Ok(code)
    }

    /// Shuts down the write half of the transport.
    pub async fn shutdown(&mut self) -> Result<(), ObexError> {
        self.io.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::split_server;

    #[tokio::test]
    async fn negotiates_smaller_packet_size() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = split_server(server_io, 1024);
            let request = reader.next_request().await.unwrap().unwrap();
            assert_eq!(request.opcode, Opcode::Connect);
            assert_eq!(request.headers.count, Some(3));
            writer.respond_connect(ResponseCode::OK).await.unwrap();
        });

        let mut client = ObexClient::new(client_io);
        let headers = HeaderSet {
            count: Some(3),
            ..Default::default()
        };
        assert_eq!(client.connect(headers).await.unwrap(), ResponseCode::OK);
        assert_eq!(client.max_packet_size(), 1024);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn request_round_trip_after_connect() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = split_server(server_io, 512);
            reader.next_request().await.unwrap().unwrap();
            writer.respond_connect(ResponseCode::OK).await.unwrap();

            let put = reader.next_request().await.unwrap().unwrap();
            assert_eq!(put.opcode, Opcode::Put { last: true });
            assert_eq!(put.headers.name.as_deref(), Some("a.txt"));
            assert_eq!(put.headers.body.as_deref(), Some(&b"hello"[..]));
            writer.respond(ResponseCode::OK).await.unwrap();
        });

        let mut client = ObexClient::new(client_io);
        client.connect(HeaderSet::new()).await.unwrap();
        assert_eq!(client.max_packet_size(), 512);

        let mut headers = HeaderSet::object("a.txt", "text/plain", 5);
        headers.body = Some(b"hello".to_vec());
        headers.end_of_body = true;
        let (code, _) = client
            .request(Opcode::Put { last: true }, headers)
            .await
            .unwrap();
        assert_eq!(code, ResponseCode::OK);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn body_budget_accounts_for_headers() {
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let client = ObexClient::with_max_packet_size(client_io, 4096);
        // Before CONNECT only the minimum packet is usable.
        let headers = HeaderSet::object("a.txt", "text/plain", 10);
        let budget = client.max_body_size(&headers);
        assert_eq!(
            budget,
            MIN_PACKET_SIZE as usize - PACKET_HEADER_LEN - VAR_HEADER_OVERHEAD - headers.encoded_len()
        );
    }

    #[tokio::test]
    async fn closed_peer_reports_closed() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        drop(server_io);
        let mut client = ObexClient::new(client_io);
        let err = client.connect(HeaderSet::new()).await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
