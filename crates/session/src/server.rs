//! Inbound session: receives objects a peer pushes to us.
//!
//! Each PUT is validated, turned into a pending inbound record and then
//! held until two things are true: the owning transfer has offered the
//! share back through [`ObexSession::add_share`], and the record's
//! confirmation has resolved. Only then is the body streamed to disk.
//!
//! Requests are decoded by a separate read pump so the worker can wait on
//! requests, commands and timers together without cancelling a partial
//! packet read.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use opush_files::{FileError, FileResolver, InboundFile, guess_mime, normalize_mime};
use opush_obex::{
    HeaderSet, ObexError, Opcode, Request, RequestReader, ResponseCode, ResponseWriter, Transport,
    split_server,
};
use opush_share::{
    Confirmation, NewShare, ShareId, ShareRecord, ShareRepository, ShareStatus, ShareUpdate,
};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventSink, SessionEvent};
use crate::notify::TransferNotifier;
use crate::policy::{InboundPolicy, Whitelist};
use crate::progress::ProgressBuckets;
use crate::status::response_for_status;
use crate::{ObexSession, SessionConfig, SessionFuture};

/// Decoded requests waiting for the worker.
const REQUEST_QUEUE: usize = 4;

/// Everything a server session needs besides its transport.
#[derive(Clone)]
pub struct ServerContext {
    pub repo: Arc<dyn ShareRepository>,
    pub resolver: Arc<dyn FileResolver>,
    pub policy: Arc<InboundPolicy>,
    pub whitelist: Arc<Whitelist>,
    pub notifier: Arc<dyn TransferNotifier>,
    pub config: SessionConfig,
}

enum Command {
    AddShare(ShareRecord),
    Unblock,
}

/// Event destination shared by the handle and the worker. Events posted
/// before a sink is attached are kept until [`ObexSession::start`].
#[derive(Default)]
struct Outbox {
    sink: Option<EventSink>,
    buffered: Vec<SessionEvent>,
}

impl Outbox {
    fn attach(&mut self, sink: EventSink) {
        for event in self.buffered.drain(..) {
            let _ = sink.send(event);
        }
        self.sink = Some(sink);
    }

    fn post(&mut self, event: SessionEvent) {
        match self.sink {
            Some(ref sink) => {
                let _ = sink.send(event);
            }
            None => self.buffered.push(event),
        }
    }
}

/// Receives pushed objects on an accepted transport.
pub struct ServerSession {
    transport: Option<Transport>,
    peer: String,
    ctx: ServerContext,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    outbox: Arc<Mutex<Outbox>>,
    stop: CancellationToken,
    /// Abandons blocked writes to the peer as well as waits.
    close: CancellationToken,
    finished: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ServerSession {
    pub fn new(transport: Transport, ctx: ServerContext) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            peer: transport.remote().to_string(),
            transport: Some(transport),
            ctx,
            commands,
            commands_rx: Some(commands_rx),
            outbox: Arc::new(Mutex::new(Outbox::default())),
            stop: CancellationToken::new(),
            close: CancellationToken::new(),
            finished: CancellationToken::new(),
            handle: None,
        }
    }

    /// Starts serving the peer before any transfer owns the session.
    /// Events produced until [`ObexSession::start`] are buffered.
    pub fn pre_start(&mut self) {
        let (Some(transport), Some(commands)) = (self.transport.take(), self.commands_rx.take())
        else {
            return;
        };
        let (reader, writer) = split_server(transport, self.ctx.config.max_packet_size);
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);
        let pump = tokio::spawn(read_pump(reader, requests_tx));

        let worker = ServerWorker {
            ctx: self.ctx.clone(),
            peer: self.peer.clone(),
            writer,
            requests,
            pump,
            commands,
            outbox: Arc::clone(&self.outbox),
            offered: HashSet::new(),
            stop: self.stop.clone(),
            close: self.close.clone(),
            timestamp: None,
            denied: false,
            accepted_any: false,
        };
        let finished = self.finished.clone();
        self.handle = Some(tokio::spawn(async move {
            worker.run().await;
            finished.cancel();
        }));
        info!(peer = %self.peer, "server session started");
    }

    /// Address of the pushing peer.
    pub fn remote(&self) -> &str {
        &self.peer
    }

    /// Whether the worker has exited (peer disconnected or stopped).
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(peer = %self.peer, "server session worker gone");
        }
    }
}

impl ObexSession for ServerSession {
    fn start(&mut self, events: EventSink, _share_count: usize) {
        self.pre_start();
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attach(events);
    }

    fn add_share(&mut self, share: ShareRecord) {
        self.send(Command::AddShare(share));
    }

    fn stop(&mut self) {
        self.stop.cancel();
    }

    fn unblock(&mut self) {
        self.send(Command::Unblock);
    }

    fn close_transport(&mut self) {
        self.close.cancel();
        self.stop.cancel();
    }

    fn join(&mut self) -> SessionFuture<'_> {
        Box::pin(async move {
            if let Some(handle) = self.handle.take() {
                if let Err(e) = handle.await {
                    error!(error = %e, "server session worker panicked");
                }
            }
        })
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Reads requests until the peer closes the stream or a packet is
/// malformed. Dropping the receiver ends the pump.
async fn read_pump(
    mut reader: RequestReader<ReadHalf<Transport>>,
    requests: mpsc::Sender<Result<Request, ObexError>>,
) {
    loop {
        match reader.next_request().await {
            Ok(Some(request)) => {
                if requests.send(Ok(request)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("peer closed the stream");
                break;
            }
            Err(e) => {
                let _ = requests.send(Err(e)).await;
                break;
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Decision {
    Accepted,
    Rejected(Confirmation),
    /// The record was deleted or finished by someone else.
    Gone,
    Aborted,
    Disconnected,
    Stopped,
}

/// A PUT that passed validation.
struct Offer {
    name: String,
    mime_type: String,
    length: u32,
    body: Option<Vec<u8>>,
    last: bool,
}

struct ServerWorker {
    ctx: ServerContext,
    peer: String,
    writer: ResponseWriter<WriteHalf<Transport>>,
    requests: mpsc::Receiver<Result<Request, ObexError>>,
    pump: JoinHandle<()>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbox: Arc<Mutex<Outbox>>,
    offered: HashSet<ShareId>,
    stop: CancellationToken,
    close: CancellationToken,
    /// Fixed at CONNECT; every object of the connection shares it, so
    /// they all land in the same batch.
    timestamp: Option<i64>,
    /// Once one object is refused every later one is too.
    denied: bool,
    accepted_any: bool,
}

impl ServerWorker {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                    continue;
                }
                request = self.requests.recv() => request,
            };
            let flow = match request {
                Some(Ok(request)) => self.handle(request).await,
                Some(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "bad request from peer");
                    Flow::Stop
                }
                None => Flow::Stop,
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        self.finish().await;
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddShare(share) => {
                debug!(share_id = share.id, "share offered to server session");
                self.offered.insert(share.id);
            }
            // The decision loop re-reads the repository after any command.
            Command::Unblock => {}
        }
    }

    async fn handle(&mut self, request: Request) -> Flow {
        match request.opcode {
            Opcode::Connect => {
                self.timestamp = Some(chrono::Utc::now().timestamp_millis());
                if self.ctx.whitelist.is_whitelisted(&self.peer) {
                    info!(peer = %self.peer, "handover transfer started");
                    self.ctx.notifier.handover_started(&self.peer);
                }
                let written = tokio::select! {
                    biased;
                    _ = self.close.cancelled() => Err(ObexError::Closed),
                    result = self.writer.respond_connect(ResponseCode::OK) => result,
                };
                match written {
                    Ok(()) => Flow::Continue,
                    Err(e) => self.lost(e),
                }
            }
            Opcode::Disconnect => {
                debug!(peer = %self.peer, "peer disconnected");
                let _ = self.write_response(ResponseCode::OK).await;
                Flow::Stop
            }
            Opcode::Abort => self.respond(ResponseCode::OK).await,
            Opcode::Put { last } => self.receive(request.headers, last).await,
            Opcode::Other(code) => {
                debug!(opcode = code, "unsupported request");
                self.respond(ResponseCode::NOT_IMPLEMENTED).await
            }
        }
    }

    async fn receive(&mut self, headers: HeaderSet, last: bool) -> Flow {
        let offer = match self.validate(headers, last) {
            Ok(offer) => offer,
            Err(code) => {
                warn!(peer = %self.peer, %code, "inbound object refused");
                return self.respond(code).await;
            }
        };

        let whitelisted = self.ctx.whitelist.is_whitelisted(&self.peer);
        let confirmation = if whitelisted {
            Confirmation::HandoverConfirmed
        } else if self.accepted_any {
            Confirmation::AutoConfirmed
        } else {
            Confirmation::Pending
        };
        let timestamp = *self
            .timestamp
            .get_or_insert_with(|| chrono::Utc::now().timestamp_millis());
        let share = NewShare::inbound(offer.name.clone(), self.peer.clone(), timestamp)
            .with_mime_type(offer.mime_type.clone())
            .with_total_bytes(u64::from(offer.length))
            .with_confirmation(confirmation);

        let id = match self.ctx.repo.insert(share) {
            Ok(id) => id,
            Err(e) => {
                error!(peer = %self.peer, error = %e, "cannot record inbound share");
                return self.respond(ResponseCode::INTERNAL_ERROR).await;
            }
        };
        info!(share_id = id, name = %offer.name, length = offer.length, ?confirmation, "inbound object offered");
        if confirmation == Confirmation::Pending {
            if let Ok(Some(record)) = self.ctx.repo.get(id) {
                self.ctx.notifier.confirmation_requested(&record);
            }
        }

        match self.await_decision(id).await {
            Decision::Accepted => {
                self.accepted_any = true;
                self.receive_body(id, offer).await
            }
            Decision::Rejected(confirmation) => {
                let code = if confirmation == Confirmation::Timeout {
                    ResponseCode::SERVICE_UNAVAILABLE
                } else {
                    ResponseCode::FORBIDDEN
                };
                info!(share_id = id, ?confirmation, "inbound object declined");
                self.denied = true;
                self.complete(id, ShareStatus::Canceled);
                self.respond(code).await
            }
            Decision::Gone => {
                self.denied = true;
                self.respond(ResponseCode::FORBIDDEN).await
            }
            Decision::Aborted => {
                self.complete(id, ShareStatus::Canceled);
                self.respond(ResponseCode::OK).await
            }
            Decision::Disconnected => {
                self.complete(id, ShareStatus::ConnectionError);
                Flow::Stop
            }
            Decision::Stopped => {
                self.complete(id, ShareStatus::Canceled);
                Flow::Stop
            }
        }
    }

    fn validate(&self, headers: HeaderSet, last: bool) -> Result<Offer, ResponseCode> {
        if self.denied {
            return Err(ResponseCode::FORBIDDEN);
        }
        let name = headers.name.unwrap_or_default();
        if name.trim().is_empty() {
            return Err(ResponseCode::BAD_REQUEST);
        }
        let length = match headers.length {
            Some(length) if length > 0 => length,
            _ => return Err(ResponseCode::LENGTH_REQUIRED),
        };
        let mime_type = headers
            .mime_type
            .as_deref()
            .and_then(normalize_mime)
            .or_else(|| guess_mime(&name))
            .ok_or(ResponseCode::BAD_REQUEST)?;
        if !self.ctx.whitelist.is_whitelisted(&self.peer) && !self.ctx.policy.accepts(&mime_type)
        {
            return Err(ResponseCode::UNSUPPORTED_MEDIA_TYPE);
        }
        Ok(Offer {
            name,
            mime_type,
            length,
            body: headers.body,
            last,
        })
    }

    /// Holds the object until the share is offered and confirmed, or
    /// refused. Posts one [`SessionEvent::ConnectTimeout`] if nobody
    /// decides in time; the owner answers it by writing a Timeout
    /// confirmation.
    async fn await_decision(&mut self, id: ShareId) -> Decision {
        let deadline = tokio::time::sleep(self.ctx.config.connect_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut tick = tokio::time::interval(self.ctx.config.confirm_poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.ctx.repo.get(id) {
                Ok(Some(record)) => {
                    if record.confirmation.is_rejected() {
                        return Decision::Rejected(record.confirmation);
                    }
                    if record.status.is_terminal() {
                        debug!(share_id = id, status = %record.status, "share finished while waiting");
                        return Decision::Gone;
                    }
                    if record.confirmation.is_accepted() && self.offered.contains(&id) {
                        return Decision::Accepted;
                    }
                }
                Ok(None) => return Decision::Gone,
                Err(e) => error!(share_id = id, error = %e, "repository read failed"),
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Decision::Stopped,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => return Decision::Stopped,
                },
                request = self.requests.recv() => match request {
                    Some(Ok(request)) if request.opcode == Opcode::Abort => {
                        return Decision::Aborted;
                    }
                    Some(Ok(request)) => {
                        warn!(opcode = ?request.opcode, "request while awaiting confirmation ignored");
                    }
                    Some(Err(_)) | None => return Decision::Disconnected,
                },
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(share_id = id, "confirmation timed out");
                    self.emit(SessionEvent::ConnectTimeout);
                }
                _ = tick.tick() => {}
            }
        }
    }

    async fn receive_body(&mut self, id: ShareId, offer: Offer) -> Flow {
        let length = u64::from(offer.length);
        let InboundFile { path, mut file } =
            match self.ctx.resolver.allocate_inbound(&offer.name, length).await {
                Ok(inbound) => inbound,
                Err(e) => {
                    let status = e.status();
                    warn!(share_id = id, error = %e, "cannot allocate inbound file");
                    self.complete(id, status);
                    return self.respond(response_for_status(status)).await;
                }
            };
        self.update(id, ShareUpdate::new().with_path(path.clone()));

        let mut progress = ProgressBuckets::new(length);
        let mut received = 0u64;
        let mut body = offer.body;
        let mut last = offer.last;

        loop {
            if let Some(bytes) = body.take() {
                if received + bytes.len() as u64 > length {
                    warn!(share_id = id, received, length, "object larger than declared");
                    drop(file);
                    discard(&path).await;
                    self.complete(id, ShareStatus::ObexDataError);
                    return self.respond(ResponseCode::ENTITY_TOO_LARGE).await;
                }
                if let Err(e) = file.write_all(&bytes).await {
                    drop(file);
                    discard(&path).await;
                    return self.write_failed(id, e).await;
                }
                received += bytes.len() as u64;
                if progress.advance(received) {
                    self.update(id, ShareUpdate::new().with_current_bytes(received));
                }
            }
            if last {
                break;
            }
            if let Err(e) = self.write_response(ResponseCode::CONTINUE).await {
                drop(file);
                discard(&path).await;
                self.complete(id, ShareStatus::ConnectionError);
                return self.lost(e);
            }

            let request = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                request = self.requests.recv() => Some(request),
            };
            let request = match request {
                None => {
                    info!(share_id = id, "receive stopped");
                    drop(file);
                    discard(&path).await;
                    self.complete(id, ShareStatus::Canceled);
                    return Flow::Stop;
                }
                Some(Some(Ok(request))) => request,
                Some(_) => {
                    warn!(share_id = id, peer = %self.peer, "transport lost during receive");
                    drop(file);
                    discard(&path).await;
                    self.complete(id, ShareStatus::ConnectionError);
                    return Flow::Stop;
                }
            };
            match request.opcode {
                Opcode::Put { last: final_packet } => {
                    body = request.headers.body;
                    last = final_packet;
                }
                Opcode::Abort => {
                    info!(share_id = id, "peer aborted object");
                    drop(file);
                    discard(&path).await;
                    self.complete(id, ShareStatus::Canceled);
                    return self.respond(ResponseCode::OK).await;
                }
                Opcode::Disconnect => {
                    drop(file);
                    discard(&path).await;
                    self.complete(id, ShareStatus::ConnectionError);
                    let _ = self.write_response(ResponseCode::OK).await;
                    return Flow::Stop;
                }
                other => {
                    warn!(share_id = id, opcode = ?other, "unexpected request mid-object");
                    drop(file);
                    discard(&path).await;
                    self.complete(id, ShareStatus::ObexDataError);
                    return self.respond(ResponseCode::BAD_REQUEST).await;
                }
            }
        }

        if let Err(e) = file.flush().await {
            drop(file);
            discard(&path).await;
            return self.write_failed(id, e).await;
        }
        drop(file);

        if received != length {
            warn!(share_id = id, received, length, "object length mismatch");
            discard(&path).await;
            self.complete(id, ShareStatus::ObexDataError);
            return self.respond(ResponseCode::BAD_REQUEST).await;
        }

        self.update(id, ShareUpdate::new().with_current_bytes(length));
        info!(share_id = id, path = %path.display(), length, "inbound object received");
        self.complete(id, ShareStatus::Success);
        self.respond(ResponseCode::OK).await
    }

    async fn write_failed(&mut self, id: ShareId, e: std::io::Error) -> Flow {
        let status = FileError::from(e).status();
        warn!(share_id = id, %status, "writing inbound file failed");
        self.complete(id, status);
        self.respond(response_for_status(status)).await
    }

    /// Writes one response unless the transport is closed first.
    async fn write_response(&mut self, code: ResponseCode) -> Result<(), ObexError> {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => Err(ObexError::Closed),
            result = self.writer.respond(code) => result,
        }
    }

    async fn respond(&mut self, code: ResponseCode) -> Flow {
        match self.write_response(code).await {
            Ok(()) => Flow::Continue,
            Err(e) => self.lost(e),
        }
    }

    fn lost(&self, e: ObexError) -> Flow {
        warn!(peer = %self.peer, error = %e, "cannot answer peer");
        Flow::Stop
    }

    async fn finish(&mut self) {
        if !self.close.is_cancelled() {
            let _ = timeout(self.ctx.config.disconnect_timeout, self.writer.shutdown()).await;
        }
        self.pump.abort();
        self.emit(SessionEvent::SessionComplete);
        info!(peer = %self.peer, "server session finished");
    }

    fn update(&self, id: ShareId, update: ShareUpdate) {
        if let Err(e) = self.ctx.repo.update(id, update) {
            error!(share_id = id, error = %e, "repository update failed");
        }
    }

    fn complete(&self, share_id: ShareId, status: ShareStatus) {
        self.emit(SessionEvent::ShareComplete { share_id, status });
    }

    fn emit(&self, event: SessionEvent) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .post(event);
    }
}

/// Removes a partially received file.
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "cannot remove partial file");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opush_files::FsResolver;
    use opush_obex::testing::{PushObject, PushReport, push_objects};
    use opush_obex::ObexClient;
    use opush_share::{MemoryRepository, ShareFilter, ShareOrder};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::notify::NoopNotifier;

    struct Harness {
        repo: Arc<MemoryRepository>,
        whitelist: Arc<Whitelist>,
        session: ServerSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        dir: tempfile::TempDir,
        client: Option<DuplexStream>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let repo = Arc::new(MemoryRepository::new());
        let whitelist = Arc::new(Whitelist::default());
        let ctx = ServerContext {
            repo: repo.clone(),
            resolver: Arc::new(FsResolver::new(dir.path())),
            policy: Arc::new(InboundPolicy::default()),
            whitelist: whitelist.clone(),
            notifier: Arc::new(NoopNotifier),
            config,
        };
        let mut session = ServerSession::new(Transport::new(server_io, "peer"), ctx);
        session.pre_start();
        let (tx, rx) = mpsc::unbounded_channel();
        session.start(tx, 0);
        Harness {
            repo,
            whitelist,
            session,
            events: rx,
            dir,
            client: Some(client_io),
        }
    }

    impl Harness {
        fn push(&mut self, objects: Vec<PushObject>) -> JoinHandle<PushReport> {
            let io = self.client.take().unwrap();
            tokio::spawn(push_objects(io, objects, 1000))
        }

        /// Waits for the n-th inbound record and offers it to the session.
        async fn offer(&mut self, n: usize) -> ShareRecord {
            let record = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let records = self
                        .repo
                        .query(&ShareFilter::default(), ShareOrder::IdAscending)
                        .unwrap();
                    if records.len() >= n {
                        return records[n - 1].clone();
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("record in time");
            self.session.add_share(record.clone());
            record
        }

        fn records(&self) -> Vec<ShareRecord> {
            self.repo
                .query(&ShareFilter::default(), ShareOrder::IdAscending)
                .unwrap()
        }

        async fn next(&mut self) -> SessionEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("event in time")
                .expect("channel open")
        }
    }

    #[tokio::test]
    async fn whitelisted_peer_skips_confirmation() {
        let mut h = harness(SessionConfig::default());
        h.whitelist.add("peer");
        let push = h.push(vec![PushObject::new(
            "photo.jpg",
            "image/jpeg",
            vec![5u8; 2500],
        )]);

        let record = h.offer(1).await;
        assert_eq!(record.confirmation, Confirmation::HandoverConfirmed);
        assert_eq!(record.total_bytes, 2500);
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: record.id,
                status: ShareStatus::Success
            }
        );
        assert_eq!(h.next().await, SessionEvent::SessionComplete);

        let report = push.await.unwrap();
        assert_eq!(report.responses, vec![ResponseCode::OK]);
        let stored = h.repo.get(record.id).unwrap().unwrap();
        let path = stored.path.unwrap();
        assert_eq!(path, h.dir.path().join("photo.jpg"));
        assert_eq!(std::fs::read(path).unwrap(), vec![5u8; 2500]);
        assert_eq!(stored.current_bytes, 2500);
    }

    #[tokio::test]
    async fn waits_for_user_then_auto_confirms_the_rest() {
        let mut h = harness(SessionConfig {
            confirm_poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let push = h.push(vec![
            PushObject::new("a.txt", "text/plain", b"first".to_vec()),
            PushObject::new("b.txt", "text/plain", b"second".to_vec()),
        ]);

        let first = h.offer(1).await;
        assert_eq!(first.confirmation, Confirmation::Pending);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.events.try_recv().is_err());

        h.repo
            .update(
                first.id,
                ShareUpdate::new().with_confirmation(Confirmation::Confirmed),
            )
            .unwrap();
        h.session.unblock();
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: first.id,
                status: ShareStatus::Success
            }
        );

        let second = h.offer(2).await;
        assert_eq!(second.confirmation, Confirmation::AutoConfirmed);
        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: second.id,
                status: ShareStatus::Success
            }
        );
        assert_eq!(
            push.await.unwrap().responses,
            vec![ResponseCode::OK, ResponseCode::OK]
        );
    }

    #[tokio::test]
    async fn denial_refuses_everything_after() {
        let mut h = harness(SessionConfig::default());
        let push = h.push(vec![
            PushObject::new("a.txt", "text/plain", b"one".to_vec()),
            PushObject::new("b.txt", "text/plain", b"two".to_vec()),
        ]);

        let first = h.offer(1).await;
        h.repo
            .update(
                first.id,
                ShareUpdate::new().with_confirmation(Confirmation::Denied),
            )
            .unwrap();
        h.session.unblock();
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: first.id,
                status: ShareStatus::Canceled
            }
        );

        let report = push.await.unwrap();
        assert_eq!(
            report.responses,
            vec![ResponseCode::FORBIDDEN, ResponseCode::FORBIDDEN]
        );
        assert_eq!(h.records().len(), 1);
    }

    #[tokio::test]
    async fn silence_posts_a_timeout() {
        let mut h = harness(SessionConfig {
            connect_timeout: Duration::from_millis(30),
            ..Default::default()
        });
        let push = h.push(vec![PushObject::new("a.txt", "text/plain", b"x".to_vec())]);

        let record = h.offer(1).await;
        assert_eq!(h.next().await, SessionEvent::ConnectTimeout);
        h.repo
            .update(
                record.id,
                ShareUpdate::new().with_confirmation(Confirmation::Timeout),
            )
            .unwrap();
        h.session.unblock();
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: record.id,
                status: ShareStatus::Canceled
            }
        );
        assert_eq!(
            push.await.unwrap().responses,
            vec![ResponseCode::SERVICE_UNAVAILABLE]
        );
    }

    #[tokio::test]
    async fn invalid_objects_create_no_records() {
        let mut h = harness(SessionConfig::default());
        let mut no_length = PushObject::new("c.txt", "text/plain", Vec::new());
        no_length.length = Some(0);
        let push = h.push(vec![
            PushObject::new("", "text/plain", b"x".to_vec()),
            no_length,
            PushObject::new("d.exe", "application/x-msdownload", b"MZ".to_vec()),
            PushObject {
                name: "noext".into(),
                mime_type: None,
                length: None,
                data: b"?".to_vec(),
            },
        ]);

        assert_eq!(
            push.await.unwrap().responses,
            vec![
                ResponseCode::BAD_REQUEST,
                ResponseCode::LENGTH_REQUIRED,
                ResponseCode::UNSUPPORTED_MEDIA_TYPE,
                ResponseCode::BAD_REQUEST,
            ]
        );
        assert!(h.records().is_empty());
        assert_eq!(h.next().await, SessionEvent::SessionComplete);
    }

    #[tokio::test]
    async fn dropped_connection_removes_partial_file() {
        let mut h = harness(SessionConfig::default());
        h.whitelist.add("peer");
        let io = h.client.take().unwrap();
        let client = tokio::spawn(async move {
            let mut client = ObexClient::new(io);
            client.connect(HeaderSet::new()).await.unwrap();
            let mut headers = HeaderSet::object("big.bin", "application/zip", 10_000);
            headers.body = Some(vec![1u8; 1000]);
            let (code, _) = client
                .request(Opcode::Put { last: false }, headers)
                .await
                .unwrap();
            assert_eq!(code, ResponseCode::CONTINUE);
            drop(client);
        });

        let record = h.offer(1).await;
        client.await.unwrap();
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: record.id,
                status: ShareStatus::ConnectionError
            }
        );
        assert_eq!(h.next().await, SessionEvent::SessionComplete);
        assert!(!h.dir.path().join("big.bin").exists());
    }

    #[tokio::test]
    async fn body_beyond_declared_length_is_refused() {
        let mut h = harness(SessionConfig::default());
        h.whitelist.add("peer");
        let io = h.client.take().unwrap();
        let client = tokio::spawn(async move {
            let mut client = ObexClient::new(io);
            client.connect(HeaderSet::new()).await.unwrap();
            let mut headers = HeaderSet::object("small.txt", "text/plain", 10);
            headers.body = Some(vec![b'a'; 8]);
            let (code, _) = client
                .request(Opcode::Put { last: false }, headers)
                .await
                .unwrap();
            assert_eq!(code, ResponseCode::CONTINUE);

            let more = HeaderSet {
                body: Some(vec![b'b'; 1000]),
                ..Default::default()
            };
            let (code, _) = client
                .request(Opcode::Put { last: false }, more)
                .await
                .unwrap();
            code
        });

        let record = h.offer(1).await;
        assert_eq!(client.await.unwrap(), ResponseCode::ENTITY_TOO_LARGE);
        assert_eq!(
            h.next().await,
            SessionEvent::ShareComplete {
                share_id: record.id,
                status: ShareStatus::ObexDataError
            }
        );
        assert!(!h.dir.path().join("small.txt").exists());
    }

    #[tokio::test]
    async fn close_transport_abandons_a_blocked_write() {
        let dir = tempfile::tempdir().unwrap();
        // Too small for the CONNECT response, and the peer never reads.
        let (server_io, mut client_io) = tokio::io::duplex(4);
        let ctx = ServerContext {
            repo: Arc::new(MemoryRepository::new()),
            resolver: Arc::new(FsResolver::new(dir.path())),
            policy: Arc::new(InboundPolicy::default()),
            whitelist: Arc::new(Whitelist::default()),
            notifier: Arc::new(NoopNotifier),
            config: SessionConfig {
                disconnect_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        };
        let mut session = ServerSession::new(Transport::new(server_io, "peer"), ctx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(tx, 0);

        client_io
            .write_all(&[0x80, 0x00, 0x07, 0x10, 0x00, 0x04, 0x00])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_finished());

        session.close_transport();
        tokio::time::timeout(Duration::from_secs(2), session.join())
            .await
            .expect("worker exits after close");
        assert_eq!(rx.recv().await, Some(SessionEvent::SessionComplete));
        drop(client_io);
    }

    #[tokio::test]
    async fn events_before_start_are_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let (server_io, client_io) = tokio::io::duplex(4096);
        let ctx = ServerContext {
            repo: Arc::new(MemoryRepository::new()),
            resolver: Arc::new(FsResolver::new(dir.path())),
            policy: Arc::new(InboundPolicy::default()),
            whitelist: Arc::new(Whitelist::default()),
            notifier: Arc::new(NoopNotifier),
            config: SessionConfig::default(),
        };
        let mut session = ServerSession::new(Transport::new(server_io, "peer"), ctx);
        session.pre_start();
        drop(client_io);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(tx, 0);
        session.join().await;
        assert_eq!(rx.recv().await, Some(SessionEvent::SessionComplete));
    }
}
