use opush_share::{ShareId, ShareStatus};
use tokio::sync::mpsc;

/// Something a session worker wants its owner to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A share finished. `status` is terminal; it may be an error that
    /// only affects this share (a file that could not be opened, an
    /// inbound object that was refused).
    ShareComplete { share_id: ShareId, status: ShareStatus },
    /// The worker exited. Sent exactly once, last.
    SessionComplete,
    /// The session cannot continue. `share_id` is the share in flight,
    /// if any.
    SessionError {
        share_id: Option<ShareId>,
        status: ShareStatus,
    },
    /// The transport went away while an outbound share was moving.
    ShareInterrupted { share_id: ShareId },
    /// The peer (or the user) has been silent for the connect timeout.
    ConnectTimeout,
}

/// Where sessions post their events.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;
