use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a media record. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Pending,
    Success,
    Error,
    Deleted,
    Archived,
}

impl MediaStatus {
    pub const ALL: [MediaStatus; 5] = [
        MediaStatus::Pending,
        MediaStatus::Success,
        MediaStatus::Error,
        MediaStatus::Deleted,
        MediaStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Success => "success",
            MediaStatus::Error => "error",
            MediaStatus::Deleted => "deleted",
            MediaStatus::Archived => "archived",
        }
    }

    /// Deleted and Archived records wait on the reconciliation queue and are
    /// invisible to review and to rescans.
    pub fn is_queued(&self) -> bool {
        matches!(self, MediaStatus::Deleted | MediaStatus::Archived)
    }

    /// Transition table for status writes that go through the store.
    ///
    /// Rewrites to the same state are allowed for the generation states so a
    /// rescan can refresh an Error or Pending row. Removal of a row is not a
    /// transition and is handled by reconciliation.
    pub fn can_transition_to(&self, to: MediaStatus) -> bool {
        use MediaStatus::*;
        match (self, to) {
            (Pending, Pending | Success | Error) => true,
            (Error, Pending | Success | Error) => true,
            (Success, Success | Pending | Error) => true,
            (Pending | Error | Success, Deleted) => true,
            (Success, Archived) => true,
            (Deleted, Success) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValue(pub String);

impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value: {:?}", self.0)
    }
}

impl std::error::Error for UnknownValue {}

impl FromStr for MediaStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MediaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownValue(s.to_string()))
    }
}

/// Where a record's mosaic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Generated,
    Imported,
}

impl MediaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaSource::Generated => "generated",
            MediaSource::Imported => "imported",
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaSource {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(MediaSource::Generated),
            "imported" => Ok(MediaSource::Imported),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}
