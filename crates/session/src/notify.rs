//! Hooks for user-facing notifications.

use opush_share::ShareRecord;

/// Receives notifications a UI would surface. All methods default to
/// no-ops.
pub trait TransferNotifier: Send + Sync + 'static {
    /// A whitelisted peer connected for a handover transfer.
    fn handover_started(&self, _peer: &str) {}

    /// An inbound object is waiting for the user's decision.
    fn confirmation_requested(&self, _share: &ShareRecord) {}
}

/// Notifier that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl TransferNotifier for NoopNotifier {}
