//! Repository interface plus an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RepositoryError;
use crate::types::{Direction, NewShare, ShareId, ShareRecord, ShareStatus, ShareUpdate, Visibility};

/// Selects a subset of records. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareFilter {
    pub direction: Option<Direction>,
    pub visibility: Option<Visibility>,
    /// `Some(true)` keeps only terminal records, `Some(false)` only active ones.
    pub terminal: Option<bool>,
}

impl ShareFilter {
    pub fn matches(&self, record: &ShareRecord) -> bool {
        self.direction.is_none_or(|d| d == record.direction)
            && self.visibility.is_none_or(|v| v == record.visibility)
            && self.terminal.is_none_or(|t| t == record.status.is_terminal())
    }
}

/// Result ordering for [`ShareRepository::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareOrder {
    #[default]
    IdAscending,
    /// Newest first; ties broken by descending id.
    TimestampDescending,
}

/// Narrow interface to the store that owns share records.
///
/// Every mutation is a single-row operation. Implementations bump the
/// change counter returned by [`subscribe`](Self::subscribe) after each
/// successful mutation.
pub trait ShareRepository: Send + Sync {
    fn insert(&self, share: NewShare) -> Result<ShareId, RepositoryError>;

    fn update(&self, id: ShareId, update: ShareUpdate) -> Result<(), RepositoryError>;

    fn delete(&self, id: ShareId) -> Result<(), RepositoryError>;

    fn get(&self, id: ShareId) -> Result<Option<ShareRecord>, RepositoryError>;

    fn query(
        &self,
        filter: &ShareFilter,
        order: ShareOrder,
    ) -> Result<Vec<ShareRecord>, RepositoryError>;

    /// Change notifications. The value is a counter; only "it changed"
    /// carries meaning.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// One accepted status write, kept for auditing while its record exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: ShareId,
    pub status: ShareStatus,
    pub at: Instant,
}

/// In-memory repository (thread-safe).
pub struct MemoryRepository {
    records: RwLock<BTreeMap<ShareId, ShareRecord>>,
    status_log: RwLock<Vec<StatusChange>>,
    next_id: AtomicI64,
    changes: watch::Sender<u64>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            records: RwLock::new(BTreeMap::new()),
            status_log: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            changes,
        }
    }

    /// Every status accepted by the repository, in write order.
    pub fn status_log(&self) -> Vec<StatusChange> {
        self.status_log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status history of a single record.
    pub fn status_history(&self, id: ShareId) -> Vec<ShareStatus> {
        self.status_log()
            .into_iter()
            .filter(|c| c.id == id)
            .map(|c| c.status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ShareId, ShareRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ShareId, ShareRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_status(&self, id: ShareId, status: ShareStatus) {
        self.status_log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StatusChange {
                id,
                status,
                at: Instant::now(),
            });
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

impl ShareRepository for MemoryRepository {
    fn insert(&self, share: NewShare) -> Result<ShareId, RepositoryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = share.into_record(id);
        let status = record.status;
        debug!(share_id = id, direction = ?record.direction, "share inserted");
        self.write().insert(id, record);
        self.log_status(id, status);
        self.notify();
        Ok(id)
    }

    fn update(&self, id: ShareId, update: ShareUpdate) -> Result<(), RepositoryError> {
        let accepted = {
            let mut records = self.write();
            let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
            let before = record.status;
            if !record.apply(&update) {
                warn!(
                    share_id = id,
                    from = %before,
                    to = ?update.status,
                    "ignoring status regression"
                );
            }
            (record.status != before).then_some(record.status)
        };
        if let Some(status) = accepted {
            self.log_status(id, status);
        }
        self.notify();
        Ok(())
    }

    fn delete(&self, id: ShareId) -> Result<(), RepositoryError> {
        self.write()
            .remove(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        self.status_log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| c.id != id);
        debug!(share_id = id, "share deleted");
        self.notify();
        Ok(())
    }

    fn get(&self, id: ShareId) -> Result<Option<ShareRecord>, RepositoryError> {
        Ok(self.read().get(&id).cloned())
    }

    fn query(
        &self,
        filter: &ShareFilter,
        order: ShareOrder,
    ) -> Result<Vec<ShareRecord>, RepositoryError> {
        let mut out: Vec<ShareRecord> = self
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if order == ShareOrder::TimestampDescending {
            out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        }
        Ok(out)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Confirmation;

    #[test]
    fn insert_assigns_increasing_ids() {
        let repo = MemoryRepository::new();
        let a = repo.insert(NewShare::outbound("file:///a", "p", 1)).unwrap();
        let b = repo.insert(NewShare::outbound("file:///b", "p", 1)).unwrap();
        assert!(b > a);
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn update_missing_record_fails() {
        let repo = MemoryRepository::new();
        let err = repo
            .update(99, ShareUpdate::new().with_status(ShareStatus::Running))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(99)));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let repo = MemoryRepository::new();
        let id = repo.insert(NewShare::outbound("file:///a", "p", 1)).unwrap();
        repo.update(id, ShareUpdate::new().with_status(ShareStatus::Running))
            .unwrap();
        repo.update(id, ShareUpdate::new().with_status(ShareStatus::Success))
            .unwrap();
        repo.update(id, ShareUpdate::new().with_status(ShareStatus::Canceled))
            .unwrap();

        let record = repo.get(id).unwrap().unwrap();
        assert_eq!(record.status, ShareStatus::Success);
        assert_eq!(
            repo.status_history(id),
            vec![ShareStatus::Pending, ShareStatus::Running, ShareStatus::Success]
        );
    }

    #[test]
    fn delete_drops_status_history() {
        let repo = MemoryRepository::new();
        let keep = repo.insert(NewShare::outbound("file:///a", "p", 1)).unwrap();
        let gone = repo.insert(NewShare::outbound("file:///b", "p", 1)).unwrap();
        repo.update(gone, ShareUpdate::new().with_status(ShareStatus::Running))
            .unwrap();

        repo.delete(gone).unwrap();
        assert!(repo.status_history(gone).is_empty());
        assert_eq!(repo.status_history(keep), vec![ShareStatus::Pending]);
        assert_eq!(repo.status_log().len(), 1);
    }

    #[test]
    fn query_filters_and_orders() {
        let repo = MemoryRepository::new();
        repo.insert(NewShare::outbound("file:///a", "p", 10)).unwrap();
        let inbound = repo.insert(NewShare::inbound("x.png", "p", 30)).unwrap();
        repo.insert(
            NewShare::outbound("file:///b", "p", 20).with_visibility(Visibility::Hidden),
        )
        .unwrap();

        let outbound = repo
            .query(
                &ShareFilter {
                    direction: Some(Direction::Outbound),
                    ..Default::default()
                },
                ShareOrder::IdAscending,
            )
            .unwrap();
        assert_eq!(outbound.len(), 2);
        assert!(outbound[0].id < outbound[1].id);

        let newest = repo
            .query(&ShareFilter::default(), ShareOrder::TimestampDescending)
            .unwrap();
        assert_eq!(newest[0].id, inbound);
    }

    #[tokio::test]
    async fn mutations_notify_subscribers() {
        let repo = MemoryRepository::new();
        let mut rx = repo.subscribe();
        let id = repo.insert(NewShare::inbound("x.png", "p", 1)).unwrap();
        rx.changed().await.unwrap();

        repo.update(
            id,
            ShareUpdate::new().with_confirmation(Confirmation::Denied),
        )
        .unwrap();
        repo.delete(id).unwrap();
        // Two more changes collapse into one wakeup.
        rx.changed().await.unwrap();
        assert!(!rx.has_changed().unwrap());
        assert!(repo.is_empty());
    }
}
