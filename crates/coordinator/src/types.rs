//! Public types for the coordinator.

use std::time::Duration;

use opush_share::Direction;
use opush_share::retention::MAX_RECORDS;
use opush_transfer::{BatchId, BatchStatus, TransferConfig, TransferState};
use serde::Serialize;

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub transfer: TransferConfig,
    /// Delay between admission attempts for a queued connection.
    pub incoming_retry_interval: Duration,
    /// Attempts before a queued connection is rejected.
    pub incoming_retry_limit: u32,
    /// Hidden successful inbound records kept by trimming.
    pub max_records: usize,
    /// Trim the repository before the first reconciliation pass.
    pub trim_on_start: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            incoming_retry_interval: Duration::from_secs(1),
            incoming_retry_limit: 20,
            max_records: MAX_RECORDS,
            trim_on_start: true,
        }
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    BatchStarted {
        batch_id: BatchId,
        direction: Direction,
        destination: String,
    },
    BatchFinished {
        batch_id: BatchId,
        direction: Direction,
        state: TransferState,
    },
    IncomingAccepted { peer: String },
    /// Busy; the connection waits for attempt `attempt + 1`.
    IncomingQueued { peer: String, attempt: u32 },
    IncomingRejected { peer: String },
    MediaScanned { share_id: i64, indexed: bool },
}

/// One batch as seen by [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: BatchId,
    pub direction: Direction,
    pub destination: String,
    pub timestamp: i64,
    pub status: BatchStatus,
    pub shares: usize,
    /// State of the transfer driving the batch, if one is.
    pub transfer: Option<TransferState>,
}

/// Where the inbound admission policy stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum AdmissionState {
    Idle,
    /// A server session is serving a connection that no transfer owns yet.
    Serving { peer: String },
    /// A connection waits for the current batches to drain.
    Waiting { peer: String, attempts: u32 },
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Batches in creation order.
    pub batches: Vec<BatchSummary>,
    pub admission: AdmissionState,
}
