//! Groups of shares moved over a single connection.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use opush_share::{
    Direction, ShareId, ShareRecord, ShareRepository, ShareStatus, ShareUpdate,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::TransferError;

/// Identifier assigned by the coordinator.
pub type BatchId = u64;

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

/// Shares with equal keys belong to the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchKey {
    pub timestamp: i64,
    pub direction: Direction,
    pub destination: String,
}

impl BatchKey {
    pub fn of(share: &ShareRecord) -> Self {
        Self {
            timestamp: share.timestamp,
            direction: share.direction,
            destination: share.destination.clone(),
        }
    }
}

/// Sent to the batch listener (the transfer driving the batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    ShareAdded(ShareId),
    Canceled,
}

/// An ordered set of shares for one peer and direction.
///
/// Shared between the coordinator and the transfer that drives it, so all
/// state sits behind a lock.
pub struct Batch {
    id: BatchId,
    key: BatchKey,
    inner: RwLock<BatchInner>,
}

struct BatchInner {
    status: BatchStatus,
    shares: Vec<ShareRecord>,
    listener: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl Batch {
    /// Creates a pending batch seeded with its first share.
    pub fn new(id: BatchId, first: ShareRecord) -> Self {
        Self {
            id,
            key: BatchKey::of(&first),
            inner: RwLock::new(BatchInner {
                status: BatchStatus::Pending,
                shares: vec![first],
                listener: None,
            }),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    pub fn destination(&self) -> &str {
        &self.key.destination
    }

    /// Whether `share` would belong to this batch.
    pub fn accepts(&self, share: &ShareRecord) -> bool {
        BatchKey::of(share) == self.key
    }

    /// Appends a share and tells the listener about it.
    pub fn add_share(&self, share: ShareRecord) -> Result<(), TransferError> {
        if !self.accepts(&share) {
            return Err(TransferError::ForeignShare {
                batch_id: self.id,
                share_id: share.id,
            });
        }
        let id = share.id;
        let listener = {
            let mut inner = self.write();
            if inner.status == BatchStatus::Failed {
                return Err(TransferError::BatchFailed(self.id));
            }
            if inner.shares.iter().any(|s| s.id == id) {
                return Ok(());
            }
            inner.shares.push(share);
            inner.listener.clone()
        };
        debug!(batch_id = self.id, share_id = id, "share added to batch");
        if let Some(listener) = listener {
            let _ = listener.send(BatchEvent::ShareAdded(id));
        }
        Ok(())
    }

    pub fn has_share(&self, id: ShareId) -> bool {
        self.read().shares.iter().any(|s| s.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.read().shares.is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().shares.len()
    }

    /// First member still waiting to be processed, in insertion order.
    pub fn pending_share(&self) -> Option<ShareRecord> {
        self.read()
            .shares
            .iter()
            .find(|s| s.status == ShareStatus::Pending)
            .cloned()
    }

    pub fn share(&self, id: ShareId) -> Option<ShareRecord> {
        self.read().shares.iter().find(|s| s.id == id).cloned()
    }

    pub fn shares(&self) -> Vec<ShareRecord> {
        self.read().shares.clone()
    }

    /// Ids of members that have not reached a terminal status.
    pub fn non_terminal_ids(&self) -> Vec<ShareId> {
        self.read()
            .shares
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id)
            .collect()
    }

    /// Replaces the local copy of a member with a fresher one from the
    /// repository and returns the previous copy. A status older than the
    /// local one is ignored.
    pub fn refresh_share(&self, fresh: &ShareRecord) -> Option<ShareRecord> {
        let mut inner = self.write();
        let slot = inner.shares.iter_mut().find(|s| s.id == fresh.id)?;
        let previous = slot.clone();
        let status = if previous.status.can_advance_to(fresh.status) {
            fresh.status
        } else {
            previous.status
        };
        *slot = fresh.clone();
        slot.status = status;
        Some(previous)
    }

    /// Updates the local status of a member. Regressions are ignored.
    pub fn mark_share(&self, id: ShareId, status: ShareStatus) {
        let mut inner = self.write();
        if let Some(share) = inner.shares.iter_mut().find(|s| s.id == id) {
            if share.status.can_advance_to(status) {
                share.status = status;
            }
        }
    }

    /// Registers the transfer that wants [`BatchEvent`]s.
    pub fn set_listener(&self, listener: mpsc::UnboundedSender<BatchEvent>) {
        self.write().listener = Some(listener);
    }

    pub fn status(&self) -> BatchStatus {
        self.read().status
    }

    pub fn set_status(&self, status: BatchStatus) {
        let mut inner = self.write();
        if inner.status != status {
            debug!(batch_id = self.id, from = ?inner.status, to = ?status, "batch status");
            inner.status = status;
        }
    }

    /// Cancels every unfinished member, deletes partially received inbound
    /// files and empties the batch. The listener is told once.
    pub fn cancel(&self, repo: &dyn ShareRepository) {
        let (shares, listener) = {
            let mut inner = self.write();
            if inner.status == BatchStatus::Failed && inner.shares.is_empty() {
                return;
            }
            inner.status = BatchStatus::Failed;
            (std::mem::take(&mut inner.shares), inner.listener.clone())
        };
        info!(batch_id = self.id, shares = shares.len(), "batch canceled");

        for share in shares.iter().filter(|s| !s.status.is_terminal()) {
            if let Err(e) = repo.update(
                share.id,
                ShareUpdate::new().with_status(ShareStatus::Canceled),
            ) {
                debug!(share_id = share.id, error = %e, "cannot cancel share");
            }
            if share.direction == Direction::Inbound {
                remove_partial(repo, share.id);
            }
        }

        if let Some(listener) = listener {
            let _ = listener.send(BatchEvent::Canceled);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BatchInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BatchInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &inner.status)
            .field("shares", &inner.shares.len())
            .finish()
    }
}

/// Deletes the file an unfinished inbound share was writing, if any.
fn remove_partial(repo: &dyn ShareRepository, id: ShareId) {
    let path = match repo.get(id) {
        Ok(Some(record)) if !record.status.is_success() => record.path,
        Ok(_) => None,
        Err(e) => {
            error!(share_id = id, error = %e, "repository read failed");
            None
        }
    };
    if let Some(path) = path {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(share_id = id, path = %path.display(), "partial file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(share_id = id, error = %e, "cannot remove partial file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use opush_share::{MemoryRepository, NewShare};

    use super::*;

    fn outbound(repo: &MemoryRepository, uri: &str, ts: i64) -> ShareRecord {
        let id = repo.insert(NewShare::outbound(uri, "peer", ts)).unwrap();
        repo.get(id).unwrap().unwrap()
    }

    #[test]
    fn members_share_one_key() {
        let repo = MemoryRepository::new();
        let a = outbound(&repo, "/a", 10);
        let b = outbound(&repo, "/b", 10);
        let other = outbound(&repo, "/c", 11);

        let batch = Batch::new(1, a.clone());
        batch.add_share(b.clone()).unwrap();
        assert!(matches!(
            batch.add_share(other),
            Err(TransferError::ForeignShare { .. })
        ));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.pending_share().map(|s| s.id), Some(a.id));

        batch.mark_share(a.id, ShareStatus::Running);
        batch.mark_share(a.id, ShareStatus::Success);
        assert_eq!(batch.pending_share().map(|s| s.id), Some(b.id));
        assert_eq!(batch.non_terminal_ids(), vec![b.id]);
    }

    #[test]
    fn listener_sees_additions() {
        let repo = MemoryRepository::new();
        let a = outbound(&repo, "/a", 10);
        let b = outbound(&repo, "/b", 10);
        let batch = Batch::new(1, a.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        batch.set_listener(tx);

        batch.add_share(b.clone()).unwrap();
        batch.add_share(b.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), BatchEvent::ShareAdded(b.id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn refresh_never_moves_status_back() {
        let repo = MemoryRepository::new();
        let a = outbound(&repo, "/a", 10);
        let batch = Batch::new(1, a.clone());
        batch.mark_share(a.id, ShareStatus::Success);

        let mut stale = a.clone();
        stale.current_bytes = 42;
        let previous = batch.refresh_share(&stale).unwrap();
        assert_eq!(previous.status, ShareStatus::Success);

        let now = batch.share(a.id).unwrap();
        assert_eq!(now.status, ShareStatus::Success);
        assert_eq!(now.current_bytes, 42);
    }

    #[test]
    fn cancel_marks_members_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let repo = MemoryRepository::new();
        let partial = dir.path().join("part.bin");
        std::fs::write(&partial, b"half").unwrap();

        let done = outbound(&repo, "/a", 10);
        let id = repo.insert(NewShare::inbound("part.bin", "peer", 10)).unwrap();
        repo.update(id, ShareUpdate::new().with_path(partial.clone()))
            .unwrap();
        let inbound = repo.get(id).unwrap().unwrap();

        let batch = Batch::new(7, inbound);
        let (tx, mut rx) = mpsc::unbounded_channel();
        batch.set_listener(tx);
        batch.cancel(&repo);
        batch.cancel(&repo);

        assert_eq!(repo.get(id).unwrap().unwrap().status, ShareStatus::Canceled);
        assert_eq!(repo.get(done.id).unwrap().unwrap().status, ShareStatus::Pending);
        assert!(!partial.exists());
        assert!(batch.is_empty());
        assert_eq!(batch.status(), BatchStatus::Failed);
        assert_eq!(rx.try_recv().unwrap(), BatchEvent::Canceled);
        assert!(rx.try_recv().is_err());
        let late = repo.insert(NewShare::inbound("late.txt", "peer", 10)).unwrap();
        assert!(matches!(
            batch.add_share(repo.get(late).unwrap().unwrap()),
            Err(TransferError::BatchFailed(7))
        ));
    }
}
