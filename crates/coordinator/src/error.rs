use opush_share::RepositoryError;

/// Errors produced by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("coordinator stopped")]
    Stopped,
}
