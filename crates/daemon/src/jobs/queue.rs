//! Filename-addressed queue operations used by outside automation.
//!
//! Callers may pass anything path-like; only the final component is used to
//! look the record up.

use engine::grid::bare_filename;
use engine::MediaStatus;
use serde::Serialize;

use crate::db::{Database, TransitionOutcome};
use crate::error::QueueError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordStatus {
    pub id: i64,
    pub status: MediaStatus,
    pub viewed: bool,
}

fn normalise(raw: &str) -> Result<&str, QueueError> {
    bare_filename(raw).ok_or(QueueError::InvalidFilename)
}

fn apply(db: &Database, raw: &str, to: MediaStatus) -> Result<i64, QueueError> {
    let filename = normalise(raw)?;
    outcome(filename, db.transition_by_filename(filename, to)?)
}

fn outcome(filename: &str, outcome: TransitionOutcome) -> Result<i64, QueueError> {
    match outcome {
        TransitionOutcome::Changed { id, .. } => Ok(id),
        TransitionOutcome::NotFound => Err(QueueError::NotFound(filename.to_string())),
        TransitionOutcome::AlreadyInState(status) | TransitionOutcome::Rejected(status) => {
            Err(QueueError::Conflict(filename.to_string(), status))
        }
    }
}

pub fn mark_archived(db: &Database, raw: &str) -> Result<i64, QueueError> {
    apply(db, raw, MediaStatus::Archived)
}

pub fn mark_for_deletion(db: &Database, raw: &str) -> Result<i64, QueueError> {
    apply(db, raw, MediaStatus::Deleted)
}

/// Undo a queued deletion that reconciliation has not executed yet.
pub fn restore(db: &Database, raw: &str) -> Result<i64, QueueError> {
    let filename = normalise(raw)?;
    let record = db
        .get_by_filename(filename)?
        .ok_or_else(|| QueueError::NotFound(filename.to_string()))?;
    outcome(filename, db.restore_deleted(record.id)?)
}

pub fn status_by_filename(db: &Database, raw: &str) -> Result<RecordStatus, QueueError> {
    let filename = normalise(raw)?;
    let record = db
        .get_by_filename(filename)?
        .ok_or_else(|| QueueError::NotFound(filename.to_string()))?;
    Ok(RecordStatus {
        id: record.id,
        status: record.status,
        viewed: record.viewed,
    })
}
