use opush_share::ShareStatus;

/// Errors produced while resolving or allocating files.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported uri: {0}")]
    UnsupportedUri(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file is empty: {0}")]
    Empty(String),

    #[error("file too large: {0} bytes")]
    TooLarge(u64),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("no storage available: {0}")]
    NoStorage(String),

    #[error("not enough space for {needed} bytes")]
    StorageFull { needed: u64 },
}

impl FileError {
    /// Share status recorded when this error ends a share.
    pub fn status(&self) -> ShareStatus {
        match self {
            Self::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => ShareStatus::StorageFull,
            Self::Io(_) | Self::NotFound(_) | Self::Empty(_) | Self::TooLarge(_) => {
                ShareStatus::FileError
            }
            Self::UnsupportedUri(_) | Self::InvalidName(_) => ShareStatus::BadRequest,
            Self::NoStorage(_) => ShareStatus::NoStorage,
            Self::StorageFull { .. } => ShareStatus::StorageFull,
        }
    }
}
