//! The coordinator actor and its handle.

use std::io;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use opush_files::FileResolver;
use opush_obex::{Connector, Transport, TransportListener};
use opush_session::{
    InboundPolicy, NoopNotifier, ObexSession, ServerContext, ServerSession, TransferNotifier,
    Whitelist,
};
use opush_share::retention::trim;
use opush_share::{
    Confirmation, Direction, ShareFilter, ShareId, ShareOrder, ShareRecord, ShareRepository,
    ShareStatus, ShareUpdate,
};
use opush_transfer::{
    Batch, BatchId, BatchStatus, Transfer, TransferContext, TransferOutcome,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, Verdict};
use crate::error::CoordinatorError;
use crate::media::MediaIndex;
use crate::reconcile::{Merge, merge_by_key};
use crate::types::{
    AdmissionState, BatchSummary, CoordinatorConfig, CoordinatorEvent, Snapshot,
};

/// Capacity of the event channel returned by [`Coordinator::take_events`].
const EVENT_BUFFER: usize = 64;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Collaborators the coordinator is built from.
#[derive(Clone)]
pub struct Services {
    pub repo: Arc<dyn ShareRepository>,
    pub resolver: Arc<dyn FileResolver>,
    pub connector: Arc<dyn Connector>,
    pub policy: Arc<InboundPolicy>,
    pub whitelist: Arc<Whitelist>,
    pub notifier: Arc<dyn TransferNotifier>,
    pub media: Option<Arc<dyn MediaIndex>>,
}

impl Services {
    /// Services with the default inbound policy, an empty whitelist, no
    /// notifications and no media index.
    pub fn new(
        repo: Arc<dyn ShareRepository>,
        resolver: Arc<dyn FileResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            repo,
            resolver,
            connector,
            policy: Arc::new(InboundPolicy::default()),
            whitelist: Arc::new(Whitelist::default()),
            notifier: Arc::new(NoopNotifier),
            media: None,
        }
    }

    pub fn with_policy(mut self, policy: InboundPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_whitelist(mut self, whitelist: Arc<Whitelist>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TransferNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaIndex>) -> Self {
        self.media = Some(media);
        self
    }
}

enum Command {
    Incoming(Transport),
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Handle to the coordinator actor.
///
/// Dropping the handle stops the actor; [`shutdown`](Self::shutdown) also
/// waits for running transfers to stop.
pub struct Coordinator {
    commands: mpsc::UnboundedSender<Command>,
    events_rx: Mutex<Option<mpsc::Receiver<CoordinatorEvent>>>,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawns the actor. It trims the repository if configured, runs a
    /// first reconciliation pass and then follows repository changes.
    pub fn start(services: Services, config: CoordinatorConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = CoordinatorActor {
            changes: services.repo.subscribe(),
            admission: Admission::new(config.incoming_retry_interval, config.incoming_retry_limit),
            services,
            config,
            commands: commands_rx,
            events: events_tx,
            outcomes_tx,
            outcomes,
            media_tx,
            media_rx,
            media_busy: false,
            cancel: cancel.clone(),
            mirror: Vec::new(),
            first_pass: true,
            batches: Vec::new(),
            next_batch_id: 1,
            outbound: None,
            inbound: None,
            server: None,
        };
        let handle = tokio::spawn(actor.run());

        Self {
            commands,
            events_rx: Mutex::new(Some(events_rx)),
            cancel,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<CoordinatorEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Hands an accepted inbound transport to the admission policy.
    pub fn incoming_connection(&self, transport: Transport) {
        let peer = transport.remote().to_string();
        if self.commands.send(Command::Incoming(transport)).is_err() {
            warn!(%peer, "coordinator stopped, dropping connection");
        }
    }

    /// Current batches and admission state.
    pub async fn snapshot(&self) -> Result<Snapshot, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Accepts connections from `listener` until shutdown.
    pub async fn serve<L: TransportListener>(&self, mut listener: L) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        debug!(peer = %transport.remote(), "inbound connection");
                        self.incoming_connection(transport);
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Stops the actor: running transfers are stopped and joined, the
    /// unattached server session is closed and a waiting connection is
    /// rejected.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "coordinator task panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct CoordinatorActor {
    services: Services,
    config: CoordinatorConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    changes: watch::Receiver<u64>,
    events: mpsc::Sender<CoordinatorEvent>,
    outcomes_tx: mpsc::UnboundedSender<TransferOutcome>,
    outcomes: mpsc::UnboundedReceiver<TransferOutcome>,
    media_tx: mpsc::UnboundedSender<(ShareId, io::Result<String>)>,
    media_rx: mpsc::UnboundedReceiver<(ShareId, io::Result<String>)>,
    media_busy: bool,
    cancel: CancellationToken,
    /// Repository records as of the last pass, ascending by id.
    mirror: Vec<ShareRecord>,
    first_pass: bool,
    /// Live batches in creation order.
    batches: Vec<Arc<Batch>>,
    next_batch_id: BatchId,
    outbound: Option<Transfer>,
    inbound: Option<Transfer>,
    /// Accepted connection that no transfer owns yet.
    server: Option<ServerSession>,
    admission: Admission<Transport>,
}

impl CoordinatorActor {
    async fn run(mut self) {
        info!("coordinator started");
        if self.config.trim_on_start {
            match trim(self.services.repo.as_ref(), self.config.max_records) {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "trimmed finished records"),
                Err(e) => error!(error = %e, "trimming failed"),
            }
        }
        self.changes.borrow_and_update();
        self.reconcile().await;

        loop {
            let retry_at = self.admission.next_retry();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(outcome) = self.outcomes.recv() => self.on_outcome(outcome).await,
                Some(command) = self.commands.recv() => self.on_command(command).await,
                changed = self.changes.changed() => {
                    if changed.is_err() {
                        warn!("repository change feed closed");
                        break;
                    }
                    self.reconcile().await;
                }
                _ = retry_timer(retry_at) => self.on_retry().await,
                Some((share_id, result)) = self.media_rx.recv() => {
                    self.on_media_scanned(share_id, result);
                }
            }
        }
        self.shutdown().await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Incoming(transport) => self.on_incoming(transport).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // --- Reconciliation ---

    async fn reconcile(&mut self) {
        if let Err(e) = self.reconcile_pass().await {
            error!(error = %e, "reconciliation failed");
        }
    }

    async fn reconcile_pass(&mut self) -> Result<(), CoordinatorError> {
        let fresh = self
            .services
            .repo
            .query(&ShareFilter::default(), ShareOrder::IdAscending)?;
        let old = std::mem::take(&mut self.mirror);
        let mut mirror = Vec::with_capacity(fresh.len());

        for step in merge_by_key(old, fresh, |r| r.id) {
            match step {
                Merge::Removed(old) => self.on_removed(&old),
                Merge::Added(new) => {
                    self.on_added(&new).await;
                    mirror.push(new);
                }
                Merge::Retained { old, new } => {
                    self.on_retained(&old, &new);
                    mirror.push(new);
                }
            }
        }

        self.mirror = mirror;
        self.first_pass = false;
        self.retire_idle();
        self.start_queued();
        self.schedule_media_scan();
        Ok(())
    }

    fn on_removed(&mut self, old: &ShareRecord) {
        if let Some(batch) = self.batch_of(old.id) {
            info!(batch_id = batch.id(), share_id = old.id, "share deleted, canceling its batch");
            batch.cancel(self.services.repo.as_ref());
        }
        if old.direction == Direction::Inbound && !old.status.is_success() {
            if let Some(ref path) = old.path {
                remove_stray(old.id, path);
            }
        }
    }

    async fn on_added(&mut self, record: &ShareRecord) {
        if self.first_pass && record.is_obsolete() {
            warn!(share_id = record.id, "share left running by a previous run");
            self.write_status(record.id, ShareStatus::UnknownError);
            return;
        }
        if !record.is_ready_to_start() {
            return;
        }
        if record.direction == Direction::Outbound {
            let uri = record.uri.as_deref().unwrap_or_default();
            let resolved = self
                .services
                .resolver
                .resolve_outbound(uri, record.mime_type.as_deref())
                .await;
            if let Err(e) = resolved {
                warn!(share_id = record.id, %uri, error = %e, "outbound file unavailable");
                self.write_status(record.id, e.status());
                return;
            }
        }
        self.place(record.clone());
    }

    fn on_retained(&mut self, old: &ShareRecord, new: &ShareRecord) {
        let Some(batch) = self.batch_of(new.id) else {
            return;
        };
        batch.refresh_share(new);

        if old.confirmation == Confirmation::Pending && new.confirmation != Confirmation::Pending {
            debug!(share_id = new.id, confirmation = ?new.confirmation, "confirmation changed");
            if let Some(ref transfer) = self.inbound
                && transfer.id() == batch.id()
            {
                transfer.confirm_status_changed();
            }
        }
    }

    /// Puts a ready share into the batch with its key, creating the batch
    /// if there is none.
    fn place(&mut self, record: ShareRecord) {
        let share_id = record.id;
        let existing = self
            .batches
            .iter()
            .find(|b| b.status() != BatchStatus::Failed && b.accepts(&record))
            .cloned();
        if let Some(batch) = existing {
            match batch.add_share(record) {
                Ok(()) => debug!(batch_id = batch.id(), share_id, "share joined batch"),
                Err(e) => warn!(share_id, error = %e, "cannot add share to batch"),
            }
            return;
        }

        if record.direction == Direction::Inbound && self.server.is_none() {
            warn!(share_id, "no connection carries this inbound share");
            self.write_status(share_id, ShareStatus::UnknownError);
            return;
        }

        let batch = Arc::new(Batch::new(self.next_batch_id, record));
        self.next_batch_id += 1;
        info!(
            batch_id = batch.id(),
            direction = ?batch.direction(),
            peer = %batch.destination(),
            "batch created"
        );
        self.batches.push(batch);
    }

    // --- Batch scheduling ---

    /// Starts the oldest waiting batch of each direction whose slot is free.
    fn start_queued(&mut self) {
        for direction in [Direction::Outbound, Direction::Inbound] {
            if self.slot(direction).is_some() {
                continue;
            }
            let next = self
                .batches
                .iter()
                .find(|b| b.direction() == direction && b.status() == BatchStatus::Pending)
                .cloned();
            if let Some(batch) = next {
                self.start_batch(batch);
            }
        }
    }

    fn start_batch(&mut self, batch: Arc<Batch>) {
        let batch_id = batch.id();
        let direction = batch.direction();
        let transfer = match direction {
            Direction::Outbound => {
                let ctx = TransferContext {
                    repo: Arc::clone(&self.services.repo),
                    resolver: Arc::clone(&self.services.resolver),
                    connector: Arc::clone(&self.services.connector),
                };
                Transfer::outbound(
                    Arc::clone(&batch),
                    ctx,
                    self.config.transfer.clone(),
                    self.outcomes_tx.clone(),
                )
            }
            Direction::Inbound => {
                let Some(session) = self.server.take() else {
                    warn!(batch_id, "no connection left for inbound batch");
                    for id in batch.non_terminal_ids() {
                        self.write_status(id, ShareStatus::UnknownError);
                        batch.mark_share(id, ShareStatus::UnknownError);
                    }
                    batch.set_status(BatchStatus::Failed);
                    return;
                };
                Transfer::inbound(
                    Arc::clone(&batch),
                    Box::new(session),
                    Arc::clone(&self.services.repo),
                    self.config.transfer.clone(),
                    self.outcomes_tx.clone(),
                )
            }
        };

        if let Err(e) = transfer.start() {
            error!(batch_id, error = %e, "cannot start transfer");
            return;
        }
        info!(batch_id, ?direction, shares = batch.len(), "batch started");
        self.emit(CoordinatorEvent::BatchStarted {
            batch_id,
            direction,
            destination: batch.destination().to_string(),
        });
        *self.slot_mut(direction) = Some(transfer);
    }

    async fn on_outcome(&mut self, outcome: TransferOutcome) {
        let slot = self.slot_mut(outcome.direction);
        let transfer = if slot.as_ref().is_some_and(|t| t.id() == outcome.batch_id) {
            slot.take()
        } else {
            None
        };
        match transfer {
            // Joined before the slot is reused.
            Some(transfer) => transfer.stop().await,
            None => warn!(batch_id = outcome.batch_id, "outcome for unknown transfer"),
        }

        self.batches.retain(|b| b.id() != outcome.batch_id);
        info!(batch_id = outcome.batch_id, state = ?outcome.state, "batch retired");
        self.emit(CoordinatorEvent::BatchFinished {
            batch_id: outcome.batch_id,
            direction: outcome.direction,
            state: outcome.state,
        });
        self.retire_idle();
        self.start_queued();
    }

    /// Drops batches that no transfer drives and that can no longer run.
    fn retire_idle(&mut self) {
        let driven = [self.outbound.as_ref(), self.inbound.as_ref()]
            .into_iter()
            .flatten()
            .map(Transfer::id)
            .collect::<Vec<_>>();
        self.batches.retain(|b| {
            let keep = driven.contains(&b.id()) || (!b.is_empty() && b.status() != BatchStatus::Failed);
            if !keep {
                debug!(batch_id = b.id(), "batch removed");
            }
            keep
        });
    }

    // --- Admission ---

    /// Whether a new connection has to wait.
    fn busy(&mut self) -> bool {
        let waiting_inbound = self
            .batches
            .iter()
            .any(|b| b.direction() == Direction::Inbound && b.status() == BatchStatus::Pending);
        if !waiting_inbound && self.server.as_ref().is_some_and(ServerSession::is_finished) {
            debug!("dropping finished server session");
            self.server = None;
        }
        !self.batches.is_empty() || self.server.is_some()
    }

    async fn on_incoming(&mut self, transport: Transport) {
        let peer = transport.remote().to_string();
        let busy = self.busy();
        match self.admission.incoming(transport, busy) {
            Verdict::Accept(transport) => self.accept(transport),
            Verdict::Reject(transport) => self.reject(transport).await,
            Verdict::Queued { attempts } => {
                info!(%peer, "busy, connection queued");
                self.emit(CoordinatorEvent::IncomingQueued {
                    peer,
                    attempt: attempts,
                });
            }
        }
    }

    async fn on_retry(&mut self) {
        let busy = self.busy();
        match self.admission.retry(busy) {
            Some(Verdict::Accept(transport)) => self.accept(transport),
            Some(Verdict::Reject(transport)) => self.reject(transport).await,
            Some(Verdict::Queued { attempts }) => {
                let peer = self
                    .admission
                    .waiting()
                    .map(|(t, _)| t.remote().to_string())
                    .unwrap_or_default();
                debug!(%peer, attempts, "still busy, connection kept waiting");
                self.emit(CoordinatorEvent::IncomingQueued {
                    peer,
                    attempt: attempts,
                });
            }
            None => {}
        }
    }

    fn accept(&mut self, transport: Transport) {
        let peer = transport.remote().to_string();
        let ctx = ServerContext {
            repo: Arc::clone(&self.services.repo),
            resolver: Arc::clone(&self.services.resolver),
            policy: Arc::clone(&self.services.policy),
            whitelist: Arc::clone(&self.services.whitelist),
            notifier: Arc::clone(&self.services.notifier),
            config: self.config.transfer.session.clone(),
        };
        let mut session = ServerSession::new(transport, ctx);
        session.pre_start();
        self.server = Some(session);
        info!(%peer, "incoming connection accepted");
        self.emit(CoordinatorEvent::IncomingAccepted { peer });
    }

    async fn reject(&mut self, transport: Transport) {
        let peer = transport.remote().to_string();
        warn!(%peer, "incoming connection rejected");
        if let Err(e) = transport.close().await {
            debug!(%peer, error = %e, "close after rejection failed");
        }
        self.emit(CoordinatorEvent::IncomingRejected { peer });
    }

    // --- Media scanning ---

    fn schedule_media_scan(&mut self) {
        if self.media_busy {
            return;
        }
        let Some(index) = self.services.media.clone() else {
            return;
        };
        let Some(record) = self.mirror.iter().find(|r| needs_media_scan(r)) else {
            return;
        };
        let (share_id, mime_type) = (record.id, record.mime_type.clone());
        let Some(path) = record.path.clone() else {
            return;
        };

        debug!(share_id, path = %path.display(), "scanning received file");
        self.media_busy = true;
        let results = self.media_tx.clone();
        tokio::spawn(async move {
            let result = index.scan(&path, mime_type.as_deref()).await;
            let _ = results.send((share_id, result));
        });
    }

    fn on_media_scanned(&mut self, share_id: ShareId, result: io::Result<String>) {
        self.media_busy = false;
        let mut update = ShareUpdate::new().with_media_scanned(true);
        let indexed = match result {
            Ok(uri) => {
                debug!(share_id, %uri, "file indexed");
                update = update.with_uri(uri);
                true
            }
            Err(e) => {
                warn!(share_id, error = %e, "media scan failed");
                false
            }
        };
        if let Err(e) = self.services.repo.update(share_id, update) {
            error!(share_id, error = %e, "repository update failed");
        }
        // Keep the mirror from offering the same file again before the
        // next pass.
        if let Some(record) = self.mirror.iter_mut().find(|r| r.id == share_id) {
            record.media_scanned = true;
        }
        self.emit(CoordinatorEvent::MediaScanned { share_id, indexed });
        self.schedule_media_scan();
    }

    // --- Helpers ---

    fn snapshot(&self) -> Snapshot {
        let batches = self
            .batches
            .iter()
            .map(|b| BatchSummary {
                id: b.id(),
                direction: b.direction(),
                destination: b.destination().to_string(),
                timestamp: b.key().timestamp,
                status: b.status(),
                shares: b.len(),
                transfer: self
                    .slot(b.direction())
                    .filter(|t| t.id() == b.id())
                    .map(Transfer::state),
            })
            .collect();

        let admission = if let Some((transport, attempts)) = self.admission.waiting() {
            AdmissionState::Waiting {
                peer: transport.remote().to_string(),
                attempts,
            }
        } else if let Some(ref server) = self.server {
            AdmissionState::Serving {
                peer: server.remote().to_string(),
            }
        } else {
            AdmissionState::Idle
        };
        Snapshot { batches, admission }
    }

    fn batch_of(&self, share_id: ShareId) -> Option<Arc<Batch>> {
        self.batches.iter().find(|b| b.has_share(share_id)).cloned()
    }

    fn slot(&self, direction: Direction) -> Option<&Transfer> {
        match direction {
            Direction::Outbound => self.outbound.as_ref(),
            Direction::Inbound => self.inbound.as_ref(),
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut Option<Transfer> {
        match direction {
            Direction::Outbound => &mut self.outbound,
            Direction::Inbound => &mut self.inbound,
        }
    }

    fn write_status(&self, share_id: ShareId, status: ShareStatus) {
        if let Err(e) = self
            .services
            .repo
            .update(share_id, ShareUpdate::new().with_status(status))
        {
            error!(share_id, %status, error = %e, "repository update failed");
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("coordinator event dropped: {e}");
        }
    }

    async fn shutdown(&mut self) {
        info!("coordinator shutting down");
        for transfer in [self.outbound.take(), self.inbound.take()].into_iter().flatten() {
            transfer.stop().await;
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
            server.join().await;
        }
        if let Some(transport) = self.admission.take() {
            let peer = transport.remote().to_string();
            if let Err(e) = transport.close().await {
                debug!(%peer, error = %e, "close on shutdown failed");
            }
        }
    }
}

/// Successful, unscanned inbound files that did not arrive by handover.
fn needs_media_scan(record: &ShareRecord) -> bool {
    record.direction == Direction::Inbound
        && record.status.is_success()
        && !record.media_scanned
        && record.confirmation != Confirmation::HandoverConfirmed
        && record.path.is_some()
}

/// Deletes the partial file of an inbound share that vanished from the
/// repository.
fn remove_stray(share_id: ShareId, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(share_id, path = %path.display(), "stray partial file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(share_id, error = %e, "cannot remove stray partial file"),
    }
}

/// Fires at `at`, or never.
async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
