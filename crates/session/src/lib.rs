//! Protocol drivers for a batch of shares.
//!
//! An [`ObexSession`] owns one transport and moves the bytes of the shares
//! handed to it. It never decides the final status of a share on its own;
//! it reports [`SessionEvent`]s to whoever started it and that owner writes
//! the outcome back to the repository.
//!
//! Two implementations exist:
//!
//! - [`ClientSession`] pushes outbound shares to a peer.
//! - [`ServerSession`] receives objects pushed by a peer, waiting for the
//!   user (or a policy) to confirm each one.

pub mod client;
pub mod events;
pub mod notify;
pub mod policy;
pub mod progress;
pub mod server;
pub mod status;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use opush_share::ShareRecord;

pub use client::ClientSession;
pub use events::{EventSink, SessionEvent};
pub use notify::{NoopNotifier, TransferNotifier};
pub use policy::{InboundPolicy, Whitelist};
pub use progress::ProgressBuckets;
pub use server::{ServerContext, ServerSession};

/// Future returned by [`ObexSession::join`].
pub type SessionFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Common contract of the client and server drivers.
pub trait ObexSession: Send + 'static {
    /// Begins delivering events to `events`. `share_count` is the number of
    /// objects announced to the peer.
    fn start(&mut self, events: EventSink, share_count: usize);

    /// Hands the next share to the session.
    fn add_share(&mut self, share: ShareRecord);

    /// Asks the worker to finish. Idempotent; does not wait.
    fn stop(&mut self);

    /// Wakes a worker waiting for a confirmation decision.
    fn unblock(&mut self) {}

    /// Drops the transport immediately, failing any I/O in progress.
    fn close_transport(&mut self);

    /// Waits for the worker task to exit.
    fn join(&mut self) -> SessionFuture<'_>;
}

/// Tunables shared by both session kinds.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a peer's first response (outbound) or for a
    /// confirmation decision (inbound) before signalling a timeout.
    pub connect_timeout: Duration,
    /// How often a confirmation wait re-reads the repository.
    pub confirm_poll_interval: Duration,
    /// Packet size offered to the peer.
    pub max_packet_size: u16,
    /// Upper bound on the final DISCONNECT exchange.
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            confirm_poll_interval: Duration::from_secs(1),
            max_packet_size: opush_obex::DEFAULT_MAX_PACKET_SIZE,
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}
