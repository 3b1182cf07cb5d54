//! Outbound session: pushes a batch of files to one peer.

use std::io;
use std::sync::Arc;

use opush_files::{FileResolver, SendableFile};
use opush_obex::{HeaderSet, ObexClient, ObexError, Opcode, ResponseCode, Transport};
use opush_share::{ShareId, ShareRecord, ShareRepository, ShareStatus, ShareUpdate};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventSink, SessionEvent};
use crate::progress::ProgressBuckets;
use crate::status::status_for_response;
use crate::{ObexSession, SessionConfig, SessionFuture};

/// Pushes outbound shares over an already connected transport.
///
/// Shares are sent strictly in the order they are added. The session
/// never picks the next share itself; its owner adds one after each
/// [`SessionEvent::ShareComplete`].
pub struct ClientSession {
    transport: Option<Transport>,
    repo: Arc<dyn ShareRepository>,
    resolver: Arc<dyn FileResolver>,
    config: SessionConfig,
    shares_tx: mpsc::UnboundedSender<ShareRecord>,
    shares_rx: Option<mpsc::UnboundedReceiver<ShareRecord>>,
    /// Cooperative stop: finish the current chunk, abort, disconnect.
    stop: CancellationToken,
    /// Forced stop: abandon the transport without further exchanges.
    close: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ClientSession {
    pub fn new(
        transport: Transport,
        repo: Arc<dyn ShareRepository>,
        resolver: Arc<dyn FileResolver>,
        config: SessionConfig,
    ) -> Self {
        let (shares_tx, shares_rx) = mpsc::unbounded_channel();
        Self {
            transport: Some(transport),
            repo,
            resolver,
            config,
            shares_tx,
            shares_rx: Some(shares_rx),
            stop: CancellationToken::new(),
            close: CancellationToken::new(),
            handle: None,
        }
    }
}

impl ObexSession for ClientSession {
    fn start(&mut self, events: EventSink, share_count: usize) {
        let (Some(transport), Some(shares)) = (self.transport.take(), self.shares_rx.take()) else {
            warn!("client session already started");
            return;
        };
        let peer = transport.remote().to_string();
        let worker = ClientWorker {
            client: ObexClient::with_max_packet_size(transport, self.config.max_packet_size),
            repo: Arc::clone(&self.repo),
            resolver: Arc::clone(&self.resolver),
            config: self.config.clone(),
            events,
            stop: self.stop.clone(),
            close: self.close.clone(),
            closed: false,
            peer,
        };
        self.handle = Some(tokio::spawn(worker.run(shares, share_count)));
    }

    fn add_share(&mut self, share: ShareRecord) {
        if self.shares_tx.send(share).is_err() {
            debug!("client session worker gone, share dropped");
        }
    }

    fn stop(&mut self) {
        self.stop.cancel();
    }

    fn close_transport(&mut self) {
        self.close.cancel();
    }

    fn join(&mut self) -> SessionFuture<'_> {
        Box::pin(async move {
            if let Some(handle) = self.handle.take() {
                if let Err(e) = handle.await {
                    error!(error = %e, "client session worker panicked");
                }
            }
        })
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

/// Why pushing one file stopped early.
#[derive(Debug)]
enum PushFailure {
    /// The peer answered with something other than CONTINUE/OK.
    Rejected(ResponseCode),
    /// Reading the local file failed or it ended before its declared length.
    Local(io::Error),
    /// Stop was requested between chunks.
    Canceled { started: bool },
    /// The transport is gone.
    Interrupted,
    /// Any other protocol failure.
    Protocol(ObexError),
}

impl From<ObexError> for PushFailure {
    fn from(e: ObexError) -> Self {
        if e.is_disconnect() {
            Self::Interrupted
        } else {
            Self::Protocol(e)
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct ClientWorker {
    client: ObexClient<Transport>,
    repo: Arc<dyn ShareRepository>,
    resolver: Arc<dyn FileResolver>,
    config: SessionConfig,
    events: EventSink,
    stop: CancellationToken,
    close: CancellationToken,
    /// Set once the transport can no longer carry a DISCONNECT.
    closed: bool,
    peer: String,
}

impl ClientWorker {
    async fn run(mut self, mut shares: mpsc::UnboundedReceiver<ShareRecord>, share_count: usize) {
        match self.connect(share_count).await {
            Ok(()) => loop {
                let share = tokio::select! {
                    biased;
                    _ = self.close.cancelled() => {
                        self.closed = true;
                        break;
                    }
                    _ = self.stop.cancelled() => break,
                    share = shares.recv() => match share {
                        Some(share) => share,
                        None => break,
                    },
                };
                if let Flow::Stop = self.push(share).await {
                    break;
                }
            },
            Err(status) => {
                self.closed = true;
                self.emit(SessionEvent::SessionError {
                    share_id: None,
                    status,
                });
            }
        }

        self.finish().await;
        self.emit(SessionEvent::SessionComplete);
        info!(peer = %self.peer, "client session finished");
    }

    async fn connect(&mut self, share_count: usize) -> Result<(), ShareStatus> {
        let headers = HeaderSet {
            count: Some(u32::try_from(share_count).unwrap_or(u32::MAX)),
            ..HeaderSet::default()
        };
        let result = tokio::select! {
            biased;
            _ = self.close.cancelled() => return Err(ShareStatus::ConnectionError),
            r = timeout(self.config.connect_timeout, self.client.connect(headers)) => r,
        };
        match result {
            Ok(Ok(ResponseCode::OK)) => {
                debug!(peer = %self.peer, max_packet = self.client.max_packet_size(), "OBEX session open");
                Ok(())
            }
            Ok(Ok(code)) => {
                warn!(peer = %self.peer, %code, "peer refused OBEX connect");
                Err(ShareStatus::ConnectionError)
            }
            Ok(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "OBEX connect failed");
                Err(ShareStatus::ConnectionError)
            }
            Err(_) => {
                warn!(peer = %self.peer, "OBEX connect timed out");
                Err(ShareStatus::ConnectionError)
            }
        }
    }

    async fn push(&mut self, share: ShareRecord) -> Flow {
        let id = share.id;
        let Some(uri) = share.uri.as_deref() else {
            warn!(share_id = id, "outbound share has no uri");
            self.complete(id, ShareStatus::BadRequest);
            return Flow::Continue;
        };

        let file = match self
            .resolver
            .resolve_outbound(uri, share.mime_type.as_deref())
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(share_id = id, error = %e, "cannot open outbound file");
                self.complete(id, e.status());
                return Flow::Continue;
            }
        };
        let length = file.length;
        self.update(
            id,
            ShareUpdate::new()
                .with_total_bytes(length)
                .with_mime_type(file.mime_type.clone()),
        );

        debug!(share_id = id, name = %file.name, length, "pushing file");
        match self.send_file(id, file).await {
            Ok(()) => {
                self.update(id, ShareUpdate::new().with_current_bytes(length));
                self.complete(id, ShareStatus::Success);
                Flow::Continue
            }
            Err(PushFailure::Rejected(code)) => {
                let status = match status_for_response(code) {
                    ShareStatus::Success => ShareStatus::UnhandledProtocolCode,
                    status => status,
                };
                warn!(share_id = id, %code, %status, "peer refused file");
                self.fail(Some(id), status);
                Flow::Stop
            }
            Err(PushFailure::Local(e)) => {
                warn!(share_id = id, error = %e, "local file read failed");
                self.abort().await;
                self.complete(id, ShareStatus::FileError);
                Flow::Continue
            }
            Err(PushFailure::Canceled { started }) => {
                info!(share_id = id, "push canceled");
                if started {
                    self.abort().await;
                }
                self.fail(Some(id), ShareStatus::Canceled);
                Flow::Stop
            }
            Err(PushFailure::Interrupted) => {
                warn!(share_id = id, peer = %self.peer, "transport lost during push");
                self.closed = true;
                self.emit(SessionEvent::ShareInterrupted { share_id: id });
                Flow::Stop
            }
            Err(PushFailure::Protocol(e)) => {
                warn!(share_id = id, error = %e, "OBEX exchange failed");
                self.fail(Some(id), ShareStatus::ObexDataError);
                Flow::Stop
            }
        }
    }

    async fn send_file(&mut self, id: ShareId, mut file: SendableFile) -> Result<(), PushFailure> {
        let declared = u32::try_from(file.length).map_err(|_| {
            PushFailure::Local(io::Error::new(io::ErrorKind::InvalidInput, "file too large"))
        })?;
        let mut headers = HeaderSet::object(file.name.clone(), file.mime_type.clone(), declared);
        let mut progress = ProgressBuckets::new(file.length);
        let mut sent = 0u64;
        let mut first = true;

        loop {
            if self.stop.is_cancelled() {
                return Err(PushFailure::Canceled { started: !first });
            }

            let room = self.client.max_body_size(&headers).max(1) as u64;
            let chunk_len = room.min(file.length - sent) as usize;
            let mut chunk = vec![0u8; chunk_len];
            let n = read_full(&mut file.reader, &mut chunk)
                .await
                .map_err(PushFailure::Local)?;
            if n < chunk_len {
                return Err(PushFailure::Local(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file ended after {} of {} bytes", sent + n as u64, file.length),
                )));
            }

            let last = sent + n as u64 == file.length;
            headers.body = Some(chunk);
            headers.end_of_body = last;
            let code = self
                .exchange(Opcode::Put { last }, std::mem::take(&mut headers), first)
                .await?;
            first = false;

            let expected = if last {
                ResponseCode::OK
            } else {
                ResponseCode::CONTINUE
            };
            if code != expected {
                return Err(PushFailure::Rejected(code));
            }

            sent += n as u64;
            if progress.advance(sent) && !last {
                self.update(id, ShareUpdate::new().with_current_bytes(sent));
            }
            if last {
                return Ok(());
            }
        }
    }

    /// Sends one request. On the first packet of a file a single
    /// [`SessionEvent::ConnectTimeout`] is posted if the peer stays silent,
    /// but the wait goes on until the peer answers or the transport is
    /// closed.
    async fn exchange(
        &mut self,
        opcode: Opcode,
        headers: HeaderSet,
        first: bool,
    ) -> Result<ResponseCode, PushFailure> {
        let request = self.client.request(opcode, headers);
        tokio::pin!(request);
        let timer = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(timer);
        let mut timed_out = !first;

        loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => return Err(PushFailure::Interrupted),
                result = &mut request => {
                    let (code, _) = result?;
                    return Ok(code);
                }
                _ = &mut timer, if !timed_out => {
                    timed_out = true;
                    warn!(peer = %self.peer, "no response from peer yet");
                    let _ = self.events.send(SessionEvent::ConnectTimeout);
                }
            }
        }
    }

    async fn abort(&mut self) {
        if self.closed || self.close.is_cancelled() {
            return;
        }
        match timeout(self.config.disconnect_timeout, self.client.abort()).await {
            Ok(Ok(code)) => debug!(%code, "abort acknowledged"),
            Ok(Err(e)) => {
                debug!(error = %e, "abort failed");
                self.closed = e.is_disconnect();
            }
            Err(_) => {
                debug!("abort timed out");
                self.closed = true;
            }
        }
    }

    async fn finish(&mut self) {
        if self.closed || self.close.is_cancelled() {
            return;
        }
        let client = &mut self.client;
        let bye = async move {
            let code = client.disconnect().await?;
            client.shutdown().await?;
            Ok::<_, ObexError>(code)
        };
        let result = timeout(self.config.disconnect_timeout, bye).await;
        match result {
            Ok(Ok(code)) => debug!(peer = %self.peer, %code, "OBEX disconnected"),
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "disconnect failed"),
            Err(_) => debug!(peer = %self.peer, "disconnect timed out"),
        }
    }

    fn update(&self, id: ShareId, update: ShareUpdate) {
        if let Err(e) = self.repo.update(id, update) {
            error!(share_id = id, error = %e, "repository update failed");
        }
    }

    fn complete(&self, share_id: ShareId, status: ShareStatus) {
        self.emit(SessionEvent::ShareComplete { share_id, status });
    }

    fn fail(&self, share_id: Option<ShareId>, status: ShareStatus) {
        self.emit(SessionEvent::SessionError { share_id, status });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Reads until `buf` is full or the stream ends.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
