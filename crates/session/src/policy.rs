//! Inbound admission policy.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use opush_files::mime_matches;
use tokio::time::Instant;
use tracing::debug;

/// How long a handover whitelist entry stays valid.
pub const DEFAULT_WHITELIST_TTL: Duration = Duration::from_secs(15);

/// MIME allow/deny lists applied to inbound objects.
///
/// An object is accepted when its type matches at least one `accept`
/// pattern and no `deny` pattern. Patterns may use `*` for the whole
/// type or subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPolicy {
    pub accept: Vec<String>,
    pub deny: Vec<String>,
}

impl Default for InboundPolicy {
    fn default() -> Self {
        Self {
            accept: [
                "image/*",
                "video/*",
                "audio/*",
                "text/x-vcard",
                "text/x-vcalendar",
                "text/calendar",
                "text/plain",
                "text/html",
                "text/xml",
                "application/pdf",
                "application/zip",
                "application/msword",
                "application/vnd.ms-excel",
                "application/vnd.ms-powerpoint",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            deny: Vec::new(),
        }
    }
}

impl InboundPolicy {
    /// Accepts anything not explicitly denied.
    pub fn permissive() -> Self {
        Self {
            accept: vec!["*/*".into()],
            deny: Vec::new(),
        }
    }

    pub fn accepts(&self, mime: &str) -> bool {
        self.accept.iter().any(|p| mime_matches(p, mime))
            && !self.deny.iter().any(|p| mime_matches(p, mime))
    }
}

/// Peers allowed to push without a confirmation prompt, each for a
/// limited time.
#[derive(Debug)]
pub struct Whitelist {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::new(DEFAULT_WHITELIST_TTL)
    }
}

impl Whitelist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whitelists `peer` for the configured TTL, refreshing an existing entry.
    pub fn add(&self, peer: &str) {
        debug!(%peer, ttl_ms = self.ttl.as_millis() as u64, "peer whitelisted");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.to_string(), Instant::now() + self.ttl);
    }

    pub fn remove(&self, peer: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    /// Checks `peer`, dropping expired entries along the way.
    pub fn is_whitelisted(&self, peer: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, expires| *expires > now);
        entries.contains_key(peer)
    }
}
