use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stable identifier assigned by the repository.
pub type ShareId = i64;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Whether the record is shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// User (or policy) decision about an inbound object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    #[default]
    Pending,
    Confirmed,
    AutoConfirmed,
    HandoverConfirmed,
    Denied,
    Timeout,
}

impl Confirmation {
    /// The object may be received.
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::AutoConfirmed | Self::HandoverConfirmed
        )
    }

    /// The object must be refused.
    pub fn is_rejected(self) -> bool {
        matches!(self, Self::Denied | Self::Timeout)
    }
}

/// Transfer status of a single share.
///
/// Codes are stable integers so callers can persist or display them.
/// Anything at or above 200 is terminal, at or above 400 is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    #[default]
    Pending,
    Running,
    Success,
    BadRequest,
    Forbidden,
    NotAcceptable,
    LengthRequired,
    Canceled,
    UnknownError,
    FileError,
    NoStorage,
    StorageFull,
    UnhandledProtocolCode,
    ObexDataError,
    ConnectionError,
}

impl ShareStatus {
    pub const ALL: [ShareStatus; 15] = [
        Self::Pending,
        Self::Running,
        Self::Success,
        Self::BadRequest,
        Self::Forbidden,
        Self::NotAcceptable,
        Self::LengthRequired,
        Self::Canceled,
        Self::UnknownError,
        Self::FileError,
        Self::NoStorage,
        Self::StorageFull,
        Self::UnhandledProtocolCode,
        Self::ObexDataError,
        Self::ConnectionError,
    ];

    /// Numeric status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Pending => 190,
            Self::Running => 192,
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotAcceptable => 406,
            Self::LengthRequired => 411,
            Self::Canceled => 490,
            Self::UnknownError => 491,
            Self::FileError => 492,
            Self::NoStorage => 493,
            Self::StorageFull => 494,
            Self::UnhandledProtocolCode => 495,
            Self::ObexDataError => 496,
            Self::ConnectionError => 497,
        }
    }

    /// Looks up a status by numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn is_terminal(self) -> bool {
        self.code() >= 200
    }

    pub fn is_error(self) -> bool {
        self.code() >= 400
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` respects
    /// PENDING -> RUNNING -> terminal. Terminal statuses never change.
    pub fn can_advance_to(self, next: ShareStatus) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for ShareStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Persisted description of one file transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    pub id: ShareId,
    pub direction: Direction,
    /// Source reference for outbound shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Filename suggested by the sender of an inbound share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Resolved local path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Peer address.
    pub destination: String,
    pub visibility: Visibility,
    pub confirmation: Confirmation,
    pub status: ShareStatus,
    pub total_bytes: u64,
    pub current_bytes: u64,
    /// Creation time in milliseconds since the Unix epoch. Shares with the
    /// same timestamp, direction and destination form one batch.
    pub timestamp: i64,
    pub media_scanned: bool,
}

impl ShareRecord {
    /// Whether the coordinator may schedule this share.
    pub fn is_ready_to_start(&self) -> bool {
        match self.direction {
            Direction::Outbound => self.status == ShareStatus::Pending && self.uri.is_some(),
            Direction::Inbound => self.status == ShareStatus::Pending,
        }
    }

    /// A share left running by a previous process can never finish.
    pub fn is_obsolete(&self) -> bool {
        self.status == ShareStatus::Running
    }

    /// Applies a partial update. A status regression is dropped and
    /// reported through the return value; the other fields still apply.
    pub fn apply(&mut self, update: &ShareUpdate) -> bool {
        let mut status_ok = true;
        if let Some(status) = update.status {
            if self.status.can_advance_to(status) {
                self.status = status;
            } else {
                status_ok = false;
            }
        }
        if let Some(confirmation) = update.confirmation {
            self.confirmation = confirmation;
        }
        if let Some(ref path) = update.path {
            self.path = Some(path.clone());
        }
        if let Some(ref uri) = update.uri {
            self.uri = Some(uri.clone());
        }
        if let Some(ref mime) = update.mime_type {
            self.mime_type = Some(mime.clone());
        }
        if let Some(total) = update.total_bytes {
            self.total_bytes = total;
        }
        if let Some(current) = update.current_bytes {
            self.current_bytes = current;
        }
        if let Some(visibility) = update.visibility {
            self.visibility = visibility;
        }
        if let Some(scanned) = update.media_scanned {
            self.media_scanned = scanned;
        }
        status_ok
    }
}

/// A record about to be inserted; the repository assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShare {
    pub direction: Direction,
    pub uri: Option<String>,
    pub hint: Option<String>,
    pub mime_type: Option<String>,
    pub destination: String,
    pub visibility: Visibility,
    pub confirmation: Confirmation,
    pub status: ShareStatus,
    pub total_bytes: u64,
    pub timestamp: i64,
}

impl NewShare {
    /// A pending outbound share of `uri` to `destination`.
    pub fn outbound(uri: impl Into<String>, destination: impl Into<String>, timestamp: i64) -> Self {
        Self {
            direction: Direction::Outbound,
            uri: Some(uri.into()),
            hint: None,
            mime_type: None,
            destination: destination.into(),
            visibility: Visibility::Visible,
            confirmation: Confirmation::Pending,
            status: ShareStatus::Pending,
            total_bytes: 0,
            timestamp,
        }
    }

    /// A pending inbound share offered by `destination`.
    pub fn inbound(hint: impl Into<String>, destination: impl Into<String>, timestamp: i64) -> Self {
        Self {
            direction: Direction::Inbound,
            uri: None,
            hint: Some(hint.into()),
            mime_type: None,
            destination: destination.into(),
            visibility: Visibility::Visible,
            confirmation: Confirmation::Pending,
            status: ShareStatus::Pending,
            total_bytes: 0,
            timestamp,
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = total;
        self
    }

    pub fn with_confirmation(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_status(mut self, status: ShareStatus) -> Self {
        self.status = status;
        self
    }

    /// The record a repository stores for this share under `id`.
    pub fn into_record(self, id: ShareId) -> ShareRecord {
        ShareRecord {
            id,
            direction: self.direction,
            uri: self.uri,
            hint: self.hint,
            path: None,
            mime_type: self.mime_type,
            destination: self.destination,
            visibility: self.visibility,
            confirmation: self.confirmation,
            status: self.status,
            total_bytes: self.total_bytes,
            current_bytes: 0,
            timestamp: self.timestamp,
            media_scanned: false,
        }
    }
}

/// Partial update of a record. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareUpdate {
    pub status: Option<ShareStatus>,
    pub confirmation: Option<Confirmation>,
    pub path: Option<PathBuf>,
    pub uri: Option<String>,
    pub mime_type: Option<String>,
    pub total_bytes: Option<u64>,
    pub current_bytes: Option<u64>,
    pub visibility: Option<Visibility>,
    pub media_scanned: Option<bool>,
}

impl ShareUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ShareStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_confirmation(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = Some(total);
        self
    }

    pub fn with_current_bytes(mut self, current: u64) -> Self {
        self.current_bytes = Some(current);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_media_scanned(mut self, scanned: bool) -> Self {
        self.media_scanned = Some(scanned);
        self
    }
}
