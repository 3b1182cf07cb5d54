//! Byte-stream transports and the seams that produce them.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Anything a transport can wrap.
pub trait TransportIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A connected, reliable byte stream to a peer.
pub struct Transport {
    io: Box<dyn TransportIo>,
    remote: String,
}

impl Transport {
    pub fn new(io: impl TransportIo, remote: impl Into<String>) -> Self {
        Self {
            io: Box::new(io),
            remote: remote.into(),
        }
    }

    /// Address of the peer.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Shuts the stream down. Used when a connection is abandoned.
    pub async fn close(mut self) -> io::Result<()> {
        debug!(peer = %self.remote, "closing transport");
        self.io.shutdown().await
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Transport>> + Send + 'a>>;

/// Future returned by [`TransportListener::accept`].
pub type AcceptFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Transport>> + Send + 'a>>;

/// Opens outbound transports.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, destination: &'a str) -> ConnectFuture<'a>;
}

/// Yields inbound transports.
pub trait TransportListener: Send + 'static {
    fn accept(&mut self) -> AcceptFuture<'_>;
}

/// Connects over TCP; the destination is a `host:port` string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, destination: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let stream = TcpStream::connect(destination).await?;
            stream.set_nodelay(true)?;
            let remote = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| destination.to_string());
            Ok(Transport::new(stream, remote))
        })
    }
}

/// Accepts OBEX clients on a TCP socket.
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening for OBEX clients");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

impl TransportListener for TcpTransportListener {
    fn accept(&mut self) -> AcceptFuture<'_> {
        Box::pin(async move {
            let (stream, addr) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            debug!(%addr, "accepted OBEX client");
            Ok(Transport::new(stream, addr.to_string()))
        })
    }
}
