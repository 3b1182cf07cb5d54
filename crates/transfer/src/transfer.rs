//! Per-batch transfer state machine.
//!
//! ```text
//! Idle ──start──▶ Connecting ──connected──▶ SessionActive ──▶ Complete
//!   │                 │                          │
//!   │ (inbound)       └──────── failure ─────────┴──────────▶ Failed
//!   └────────────────────────────▶ SessionActive
//! ```
//!
//! Each transfer runs as its own task. Session events, batch events and
//! commands from the coordinator all arrive on channels and are handled
//! one at a time, so share and batch statuses are only ever written from
//! this task once the session is running.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use opush_files::FileResolver;
use opush_obex::{Connector, Transport};
use opush_session::{ClientSession, EventSink, ObexSession, SessionConfig, SessionEvent};
use opush_share::{
    Confirmation, Direction, ShareId, ShareRepository, ShareStatus, ShareUpdate,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchEvent, BatchId, BatchStatus};
use crate::connect::connect_with_retry;
use crate::error::TransferError;

/// Where a transfer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Connecting,
    SessionActive,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Transfer tunables.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bound on a single transport connect attempt.
    pub connect_timeout: Duration,
    /// Pause before the one retry after a link-key race.
    pub link_key_retry_delay: Duration,
    /// Substring identifying a link-key race in a connect error.
    pub link_key_error_marker: String,
    pub session: SessionConfig,
    /// Bound on waiting for a stopped session to exit.
    pub session_join_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            link_key_retry_delay: Duration::from_millis(200),
            link_key_error_marker: "link key".to_string(),
            session: SessionConfig::default(),
            session_join_timeout: Duration::from_secs(5),
        }
    }
}

/// Collaborators an outbound transfer needs.
#[derive(Clone)]
pub struct TransferContext {
    pub repo: Arc<dyn ShareRepository>,
    pub resolver: Arc<dyn FileResolver>,
    pub connector: Arc<dyn Connector>,
}

/// Reported once when a transfer reaches a terminal state on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub batch_id: BatchId,
    pub direction: Direction,
    pub state: TransferState,
}

enum Origin {
    Outbound {
        resolver: Arc<dyn FileResolver>,
        connector: Arc<dyn Connector>,
    },
    Inbound(Box<dyn ObexSession>),
}

enum Command {
    ConfirmStatusChanged,
}

/// Drives one batch to completion.
pub struct Transfer {
    batch: Arc<Batch>,
    repo: Arc<dyn ShareRepository>,
    config: TransferConfig,
    origin: Mutex<Option<Origin>>,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
    state: Arc<watch::Sender<TransferState>>,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    cancel: CancellationToken,
    finished: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Transfer {
    /// A transfer that connects to the batch destination and pushes.
    pub fn outbound(
        batch: Arc<Batch>,
        ctx: TransferContext,
        config: TransferConfig,
        outcomes: mpsc::UnboundedSender<TransferOutcome>,
    ) -> Self {
        let origin = Origin::Outbound {
            resolver: ctx.resolver,
            connector: ctx.connector,
        };
        Self::new(batch, ctx.repo, origin, config, outcomes)
    }

    /// A transfer that adopts an accepted server session.
    pub fn inbound(
        batch: Arc<Batch>,
        session: Box<dyn ObexSession>,
        repo: Arc<dyn ShareRepository>,
        config: TransferConfig,
        outcomes: mpsc::UnboundedSender<TransferOutcome>,
    ) -> Self {
        Self::new(batch, repo, Origin::Inbound(session), config, outcomes)
    }

    fn new(
        batch: Arc<Batch>,
        repo: Arc<dyn ShareRepository>,
        origin: Origin,
        config: TransferConfig,
        outcomes: mpsc::UnboundedSender<TransferOutcome>,
    ) -> Self {
        let (state, _) = watch::channel(TransferState::Idle);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            batch,
            repo,
            config,
            origin: Mutex::new(Some(origin)),
            outcomes,
            state: Arc::new(state),
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> BatchId {
        self.batch.id()
    }

    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    pub fn direction(&self) -> Direction {
        self.batch.direction()
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// State changes, starting with the current state.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// Spawns the transfer task. Outbound transfers start connecting;
    /// inbound ones start their session right away.
    pub fn start(&self) -> Result<(), TransferError> {
        let origin = self
            .origin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransferError::AlreadyStarted)?;
        let commands = self
            .commands_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransferError::AlreadyStarted)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (batch_tx, batch_events) = mpsc::unbounded_channel();
        self.batch.set_listener(batch_tx);

        let (session, resolver, connect) = match origin {
            Origin::Inbound(session) => (Some(session), None, None),
            Origin::Outbound {
                resolver,
                connector,
            } => {
                let destination = self.batch.destination().to_string();
                let config = self.config.clone();
                let task = tokio::spawn(async move {
                    connect_with_retry(connector.as_ref(), &destination, &config).await
                });
                (None, Some(resolver), Some(task))
            }
        };

        let actor = TransferActor {
            direction: self.batch.direction(),
            batch: Arc::clone(&self.batch),
            repo: Arc::clone(&self.repo),
            config: self.config.clone(),
            resolver,
            connect,
            session,
            state: Arc::clone(&self.state),
            events_tx,
            events,
            batch_events,
            commands,
            cancel: self.cancel.clone(),
            outcomes: self.outcomes.clone(),
            current: None,
            stopping: false,
        };
        let finished = self.finished.clone();
        let handle = tokio::spawn(async move {
            actor.run().await;
            finished.cancel();
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Tells an inbound transfer that a share's confirmation changed.
    pub fn confirm_status_changed(&self) {
        let _ = self.commands.send(Command::ConfirmStatusChanged);
    }

    /// Stops the transfer and waits for its task and session to exit.
    ///
    /// Unfinished shares become CANCELED and no outcome is reported.
    /// Safe to call more than once and from several tasks.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let unstarted = self
            .origin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if unstarted.is_some() {
            debug!(batch_id = self.id(), "stopping transfer that never started");
            cancel_leftovers(self.repo.as_ref(), &self.batch);
            self.state.send_replace(TransferState::Failed);
            self.finished.cancel();
            return;
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(batch_id = self.id(), error = %e, "transfer task panicked");
                }
            }
            None => self.finished.cancelled().await,
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("batch", &self.batch)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn cancel_leftovers(repo: &dyn ShareRepository, batch: &Batch) {
    for id in batch.non_terminal_ids() {
        if let Err(e) = repo.update(id, ShareUpdate::new().with_status(ShareStatus::Canceled)) {
            error!(share_id = id, error = %e, "repository update failed");
        }
        batch.mark_share(id, ShareStatus::Canceled);
    }
    batch.set_status(BatchStatus::Failed);
}

struct TransferActor {
    batch: Arc<Batch>,
    direction: Direction,
    repo: Arc<dyn ShareRepository>,
    config: TransferConfig,
    resolver: Option<Arc<dyn FileResolver>>,
    connect: Option<JoinHandle<Result<Transport, String>>>,
    session: Option<Box<dyn ObexSession>>,
    state: Arc<watch::Sender<TransferState>>,
    events_tx: EventSink,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    batch_events: mpsc::UnboundedReceiver<BatchEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
    /// Share handed to the session and not yet reported back.
    current: Option<ShareId>,
    /// Outbound only: the session was asked to finish.
    stopping: bool,
}

impl TransferActor {
    async fn run(mut self) {
        let batch_id = self.batch.id();
        info!(batch_id, direction = ?self.direction, shares = self.batch.len(), "transfer started");
        self.batch.set_status(BatchStatus::Running);

        if let Some(session) = self.session.as_mut() {
            session.start(self.events_tx.clone(), self.batch.len());
            self.set_state(TransferState::SessionActive);
            self.dispatch_next();
        } else {
            self.set_state(TransferState::Connecting);
        }

        while !self.state().is_terminal() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.on_stop().await;
                    return;
                }
                result = connect_result(&mut self.connect) => {
                    self.connect = None;
                    self.on_connected(result);
                }
                Some(event) = self.events.recv() => self.on_session_event(event),
                Some(event) = self.batch_events.recv() => self.on_batch_event(event),
                Some(command) = self.commands.recv() => self.on_command(command),
            }
        }

        self.close_session().await;
        if self.cancel.is_cancelled() {
            return;
        }
        let state = self.state();
        info!(batch_id, ?state, "transfer finished");
        let _ = self.outcomes.send(TransferOutcome {
            batch_id,
            direction: self.direction,
            state,
        });
    }

    fn on_connected(&mut self, result: Result<Transport, String>) {
        let batch_id = self.batch.id();
        let transport = match result {
            Ok(transport) => transport,
            Err(message) => {
                warn!(batch_id, peer = %self.batch.destination(), error = %message, "connect failed");
                self.fail_with(ShareStatus::ConnectionError);
                return;
            }
        };
        let Some(resolver) = self.resolver.clone() else {
            error!(batch_id, "outbound transfer without a resolver");
            self.fail_with(ShareStatus::UnknownError);
            return;
        };

        let mut session = ClientSession::new(
            transport,
            Arc::clone(&self.repo),
            resolver,
            self.config.session.clone(),
        );
        session.start(self.events_tx.clone(), self.batch.len());
        self.session = Some(Box::new(session));
        self.set_state(TransferState::SessionActive);
        if !self.dispatch_next() {
            self.request_stop();
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let batch_id = self.batch.id();
        match event {
            SessionEvent::ShareComplete { share_id, status } => {
                info!(batch_id, share_id, %status, "share complete");
                self.write_status(share_id, status);
                if self.current == Some(share_id) {
                    self.current = None;
                }
                match self.direction {
                    Direction::Outbound => {
                        if !self.stopping && !self.dispatch_next() {
                            self.request_stop();
                        }
                    }
                    Direction::Inbound => {
                        if self.current.is_none() {
                            self.dispatch_next();
                        }
                    }
                }
            }
            SessionEvent::SessionComplete => {
                let leftovers = self.batch.non_terminal_ids();
                if leftovers.is_empty() {
                    self.batch.set_status(BatchStatus::Finished);
                    self.set_state(TransferState::Complete);
                } else {
                    let status = match self.direction {
                        Direction::Outbound => ShareStatus::ConnectionError,
                        Direction::Inbound => ShareStatus::Canceled,
                    };
                    warn!(batch_id, unfinished = leftovers.len(), "session ended early");
                    self.fail_with(status);
                }
            }
            SessionEvent::SessionError { share_id, status } => {
                warn!(batch_id, ?share_id, %status, "session error");
                if let Some(session) = self.session.as_mut() {
                    session.stop();
                }
                if let Some(id) = share_id {
                    self.write_status(id, status);
                }
                self.fail_with(status);
            }
            SessionEvent::ShareInterrupted { share_id } => {
                warn!(batch_id, share_id, "share interrupted");
                if let Some(session) = self.session.as_mut() {
                    session.close_transport();
                }
                self.write_status(share_id, ShareStatus::ConnectionError);
                self.fail_with(ShareStatus::ConnectionError);
            }
            SessionEvent::ConnectTimeout => match self.direction {
                Direction::Outbound => {
                    warn!(batch_id, "peer silent, closing transport");
                    if let Some(session) = self.session.as_mut() {
                        session.close_transport();
                    }
                }
                Direction::Inbound => self.confirmation_timed_out(),
            },
        }
    }

    fn on_batch_event(&mut self, event: BatchEvent) {
        match event {
            BatchEvent::ShareAdded(share_id) => {
                debug!(batch_id = self.batch.id(), share_id, "share joined running batch");
                if self.state() == TransferState::SessionActive
                    && self.current.is_none()
                    && !self.stopping
                {
                    self.dispatch_next();
                }
            }
            BatchEvent::Canceled => {
                info!(batch_id = self.batch.id(), "batch canceled under transfer");
                if let Some(task) = self.connect.take() {
                    task.abort();
                }
                if let Some(session) = self.session.as_mut() {
                    session.stop();
                }
                self.batch.set_status(BatchStatus::Failed);
                self.set_state(TransferState::Failed);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ConfirmStatusChanged => {
                if let Some(session) = self.session.as_mut() {
                    session.unblock();
                }
            }
        }
    }

    /// The inbound session has waited too long for a decision: record a
    /// Timeout confirmation on the share it is holding and wake it.
    fn confirmation_timed_out(&mut self) {
        let target = self
            .current
            .or_else(|| self.batch.pending_share().map(|s| s.id));
        if let Some(id) = target {
            match self.repo.get(id) {
                Ok(Some(record)) if record.confirmation == Confirmation::Pending => {
                    info!(share_id = id, "confirmation timed out");
                    if let Err(e) = self.repo.update(
                        id,
                        ShareUpdate::new().with_confirmation(Confirmation::Timeout),
                    ) {
                        error!(share_id = id, error = %e, "repository update failed");
                    }
                }
                Ok(_) => {}
                Err(e) => error!(share_id = id, error = %e, "repository read failed"),
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.unblock();
        }
    }

    async fn on_stop(&mut self) {
        info!(batch_id = self.batch.id(), "transfer stopped");
        self.close_session().await;
        cancel_leftovers(self.repo.as_ref(), &self.batch);
        self.set_state(TransferState::Failed);
    }

    /// Hands the next pending share to the session. Returns `false` when
    /// nothing is left.
    fn dispatch_next(&mut self) -> bool {
        let Some(mut share) = self.batch.pending_share() else {
            return false;
        };
        self.write_status(share.id, ShareStatus::Running);
        share.status = ShareStatus::Running;
        self.current = Some(share.id);
        debug!(batch_id = self.batch.id(), share_id = share.id, "dispatching share");
        if let Some(session) = self.session.as_mut() {
            session.add_share(share);
        }
        true
    }

    fn request_stop(&mut self) {
        self.stopping = true;
        if let Some(session) = self.session.as_mut() {
            session.stop();
        }
    }

    fn fail_with(&mut self, status: ShareStatus) {
        for id in self.batch.non_terminal_ids() {
            self.write_status(id, status);
        }
        self.batch.set_status(BatchStatus::Failed);
        self.set_state(TransferState::Failed);
    }

    async fn close_session(&mut self) {
        if let Some(task) = self.connect.take() {
            task.abort();
        }
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.stop();
        if timeout(self.config.session_join_timeout, session.join())
            .await
            .is_err()
        {
            warn!(batch_id = self.batch.id(), "session did not stop in time, closing transport");
            session.close_transport();
            let _ = timeout(self.config.session_join_timeout, session.join()).await;
        }
    }

    fn write_status(&self, id: ShareId, status: ShareStatus) {
        if let Err(e) = self.repo.update(id, ShareUpdate::new().with_status(status)) {
            error!(share_id = id, %status, error = %e, "repository update failed");
        }
        self.batch.mark_share(id, status);
    }

    fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    fn set_state(&self, state: TransferState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(batch_id = self.batch.id(), from = ?previous, to = ?state, "transfer state");
        }
    }
}

/// Resolves with the connect worker's result, or never if there is none.
async fn connect_result(
    task: &mut Option<JoinHandle<Result<Transport, String>>>,
) -> Result<Transport, String> {
    match task {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(format!("connect worker failed: {e}")),
        },
        None => std::future::pending().await,
    }
}
