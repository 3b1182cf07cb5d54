//! Housekeeping for hidden records that nobody will look at again.

use tracing::info;

use crate::error::RepositoryError;
use crate::repository::{ShareFilter, ShareOrder, ShareRepository};
use crate::types::{Direction, ShareStatus, Visibility};

/// Default number of hidden successful inbound records kept.
pub const MAX_RECORDS: usize = 1000;

/// Deletes hidden records that are finished:
///
/// - outbound records in any terminal status,
/// - inbound records that failed,
/// - successful inbound records beyond the newest `max_records`.
///
/// Returns the number of deleted records.
pub fn trim(repo: &dyn ShareRepository, max_records: usize) -> Result<usize, RepositoryError> {
    let hidden = repo.query(
        &ShareFilter {
            visibility: Some(Visibility::Hidden),
            terminal: Some(true),
            ..Default::default()
        },
        ShareOrder::TimestampDescending,
    )?;

    let mut deleted = 0;
    let mut kept_success = 0;
    for record in hidden {
        let remove = match record.direction {
            Direction::Outbound => true,
            Direction::Inbound if record.status != ShareStatus::Success => true,
            Direction::Inbound => {
                kept_success += 1;
                kept_success > max_records
            }
        };
        if remove {
            match repo.delete(record.id) {
                Ok(()) | Err(RepositoryError::NotFound(_)) => deleted += 1,
                Err(e) => return Err(e),
            }
        }
    }

    if deleted > 0 {
        info!(deleted, "trimmed finished share records");
    }
    Ok(deleted)
}
