//! Confirmation policy for inbound objects.
//!
//! The daemon has no user to ask. With `auto_accept` every pending
//! inbound share is confirmed as soon as it appears; otherwise it is
//! logged once and left to time out.

use std::collections::HashSet;
use std::sync::Arc;

use opush_share::{
    Confirmation, Direction, RepositoryError, ShareFilter, ShareId, ShareOrder, ShareRepository,
    ShareUpdate,
};
use tracing::{info, warn};

/// Watches the repository until its change channel closes.
pub async fn run(repo: Arc<dyn ShareRepository>, auto_accept: bool) {
    let mut changes = repo.subscribe();
    let mut announced = HashSet::new();
    loop {
        if let Err(e) = confirm_pending(repo.as_ref(), auto_accept, &mut announced) {
            warn!("confirmation pass failed: {e}");
        }
        if changes.changed().await.is_err() {
            break;
        }
    }
}

/// One pass over the active inbound shares. Returns how many were confirmed.
fn confirm_pending(
    repo: &dyn ShareRepository,
    auto_accept: bool,
    announced: &mut HashSet<ShareId>,
) -> Result<usize, RepositoryError> {
    let filter = ShareFilter {
        direction: Some(Direction::Inbound),
        terminal: Some(false),
        ..Default::default()
    };
    let mut confirmed = 0;
    for share in repo.query(&filter, ShareOrder::IdAscending)? {
        if share.confirmation != Confirmation::Pending {
            continue;
        }
        if auto_accept {
            repo.update(
                share.id,
                ShareUpdate::new().with_confirmation(Confirmation::Confirmed),
            )?;
            info!(share_id = share.id, peer = %share.destination, "inbound share confirmed");
            confirmed += 1;
        } else if announced.insert(share.id) {
            info!(
                share_id = share.id,
                peer = %share.destination,
                hint = share.hint.as_deref().unwrap_or(""),
                "inbound share awaits confirmation"
            );
        }
    }
    announced.retain(|id| matches!(repo.get(*id), Ok(Some(s)) if !s.status.is_terminal()));
    Ok(confirmed)
}
