//! Keeps the set of batches and transfers in step with the share
//! repository.
//!
//! The [`Coordinator`] runs as a single actor task. Every repository
//! change triggers a reconciliation pass that merges the repository's
//! records into an in-memory mirror, groups ready shares into batches and
//! starts at most one transfer per direction. Inbound connections go
//! through an admission policy: accepted right away when idle, queued and
//! retried while busy, rejected when another connection is already
//! waiting.

mod admission;
mod coordinator;
pub mod error;
pub mod media;
pub mod reconcile;
pub mod types;

pub use admission::{Admission, Verdict};
pub use coordinator::{Coordinator, Services};
pub use error::CoordinatorError;
pub use media::{MediaFuture, MediaIndex};
pub use reconcile::{Merge, merge_by_key};
pub use types::{
    AdmissionState, BatchSummary, CoordinatorConfig, CoordinatorEvent, Snapshot,
};
