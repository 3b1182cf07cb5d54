use crate::types::ShareId;

/// Errors surfaced by a [`crate::ShareRepository`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("share {0} not found")]
    NotFound(ShareId),

    #[error("storage error: {0}")]
    Storage(String),
}
