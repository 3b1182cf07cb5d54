use opush_share::ShareId;

use crate::batch::BatchId;

/// Errors returned by batch and transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("batch {0} has failed")]
    BatchFailed(BatchId),

    #[error("share {share_id} does not belong to batch {batch_id}")]
    ForeignShare { batch_id: BatchId, share_id: ShareId },

    #[error("transfer already started")]
    AlreadyStarted,
}
