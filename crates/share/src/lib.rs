//! Share records and the repository they live in.
//!
//! A [`ShareRecord`] describes one file moving to or from a peer. The
//! repository is the single source of truth for records; everything else
//! keeps copies and reconciles against it.

pub mod error;
pub mod repository;
pub mod retention;
pub mod types;

pub use error::RepositoryError;
pub use repository::{MemoryRepository, ShareFilter, ShareOrder, ShareRepository, StatusChange};
pub use types::{
    Confirmation, Direction, NewShare, ShareId, ShareRecord, ShareStatus, ShareUpdate, Visibility,
};
