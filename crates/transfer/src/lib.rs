//! Batches and transfers.
//!
//! A [`Batch`] groups the shares that travel over one connection. A
//! [`Transfer`] drives one batch: it opens (or adopts) an OBEX session,
//! feeds it shares one at a time and writes each outcome back to the
//! repository.

pub mod batch;
pub mod connect;
pub mod error;
pub mod transfer;

pub use batch::{Batch, BatchEvent, BatchId, BatchKey, BatchStatus};
pub use connect::connect_with_retry;
pub use error::TransferError;
pub use transfer::{
    Transfer, TransferConfig, TransferContext, TransferOutcome, TransferState,
};
