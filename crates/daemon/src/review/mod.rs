//! Random-order review of generated mosaics.
//!
//! All navigation state lives in the client-held session token; the store
//! only sees `viewed` flags and committed deletions.

pub mod token;

use anyhow::Result;
use chrono::Utc;
use engine::{MediaStatus, ReviewSession, SessionEffect};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{Database, MediaRecord, TransitionOutcome};

/// What the client renders after each action.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewView {
    pub token: String,
    pub session: ReviewSession,
    pub record: Option<MediaRecord>,
    /// No further record is available after this one; the client should
    /// offer the finish action instead of fetching a next record.
    pub is_last: bool,
    pub done: bool,
    /// A deletion is still staged in the token; the client has to finish
    /// (or undo) to settle it.
    pub pending_delete: bool,
}

pub struct Navigator {
    db: Arc<Database>,
}

fn is_reviewable(record: &MediaRecord) -> bool {
    record.status == MediaStatus::Success && !record.viewed
}

impl Navigator {
    pub fn new(db: Arc<Database>) -> Self {
        Navigator { db }
    }

    pub fn fresh_session(&self) -> Result<ReviewSession> {
        Ok(ReviewSession::new(
            self.db.count_unreviewed()?,
            Utc::now().timestamp(),
        ))
    }

    /// Decode the client's token, starting a new session when it is missing,
    /// corrupt or from an older format.
    pub fn resume(&self, token: Option<&str>) -> Result<ReviewSession> {
        match token.and_then(token::decode) {
            Some(session) => Ok(session),
            None => {
                if token.is_some_and(|t| !t.trim().is_empty()) {
                    debug!("discarding unreadable review token");
                }
                self.fresh_session()
            }
        }
    }

    pub fn next_unreviewed(&self, exclude: &[i64]) -> Result<Option<MediaRecord>> {
        self.db.random_unreviewed(exclude)
    }

    pub fn mark_viewed(&self, id: i64) -> Result<bool> {
        self.db.mark_viewed(id)
    }

    pub fn mark_for_deletion(&self, id: i64) -> Result<TransitionOutcome> {
        self.db.transition_by_id(id, MediaStatus::Deleted)
    }

    fn reviewable(&self, id: i64) -> Result<Option<MediaRecord>> {
        if id == 0 {
            return Ok(None);
        }
        Ok(self.db.get_by_id(id)?.filter(is_reviewable))
    }

    fn apply(&self, effects: Vec<SessionEffect>) -> Result<()> {
        for effect in effects {
            match effect {
                SessionEffect::MarkViewed(id) => {
                    if !self.mark_viewed(id)? {
                        debug!(id, "record no longer reviewable, viewed flag not set");
                    }
                }
                SessionEffect::UnmarkViewed(id) => {
                    self.db.unmark_viewed(id)?;
                }
                SessionEffect::CommitDelete(id) => match self.mark_for_deletion(id)? {
                    TransitionOutcome::Changed { .. } => {}
                    other => warn!(id, outcome = ?other, "staged deletion could not be committed"),
                },
            }
        }
        Ok(())
    }

    /// Make sure the session points at a record that can still be reviewed,
    /// falling back to the pre-fetched pick and then to a random one.
    fn ensure_current(&self, session: &mut ReviewSession) -> Result<Option<MediaRecord>> {
        if let Some(record) = self.reviewable(session.current_record_id)? {
            return Ok(Some(record));
        }
        let exclude: Vec<i64> = [session.previous_record_id, session.pending_delete_id]
            .into_iter()
            .filter(|id| *id != 0)
            .collect();
        let record = match self.reviewable(session.next_record_id)? {
            Some(record) if !exclude.contains(&record.id) => Some(record),
            _ => self.next_unreviewed(&exclude)?,
        };
        session.show(record.as_ref().map(|r| r.id).unwrap_or(0));
        session.set_next(None);
        Ok(record)
    }

    /// Record to move to after the current one.
    fn pick_next(&self, session: &ReviewSession) -> Result<Option<i64>> {
        let exclude = session.exclusions();
        if let Some(record) = self.reviewable(session.next_record_id)? {
            if !exclude.contains(&record.id) {
                return Ok(Some(record.id));
            }
        }
        Ok(self.next_unreviewed(&exclude)?.map(|r| r.id))
    }

    fn render(&self, mut session: ReviewSession) -> Result<ReviewView> {
        let record = self.ensure_current(&mut session)?;
        let next = match &record {
            Some(_) => self.pick_next(&session)?,
            None => None,
        };
        session.set_next(next);
        Ok(ReviewView {
            token: token::encode(&session),
            is_last: record.is_some() && next.is_none(),
            done: record.is_none(),
            pending_delete: session.has_pending_delete(),
            record,
            session,
        })
    }

    pub fn new_session(&self) -> Result<ReviewView> {
        self.render(self.fresh_session()?)
    }

    pub fn current(&self, token: Option<&str>) -> Result<ReviewView> {
        self.render(self.resume(token)?)
    }

    /// The record the client was shown, if it can still be acted on. When it
    /// has gone (queued, viewed elsewhere, removed) the action is dropped and
    /// the caller re-renders so the replacement is shown first.
    fn shown(&self, session: &ReviewSession) -> Result<Option<MediaRecord>> {
        let record = self.reviewable(session.current_record_id)?;
        if record.is_none() && session.current_record_id != 0 {
            debug!(
                id = session.current_record_id,
                "shown record is no longer reviewable, action ignored"
            );
        }
        Ok(record)
    }

    pub fn keep(&self, token: Option<&str>) -> Result<ReviewView> {
        let mut session = self.resume(token)?;
        if self.shown(&session)?.is_some() {
            let next = self.pick_next(&session)?;
            let effects = session.keep(next);
            self.apply(effects)?;
        }
        self.render(session)
    }

    pub fn delete(&self, token: Option<&str>) -> Result<ReviewView> {
        let mut session = self.resume(token)?;
        if let Some(record) = self.shown(&session)? {
            let next = self.pick_next(&session)?;
            let size = u64::try_from(record.file_size_bytes).unwrap_or(0);
            let effects = session.stage_delete(next, size);
            self.apply(effects)?;
        }
        self.render(session)
    }

    pub fn undo(&self, token: Option<&str>) -> Result<ReviewView> {
        let mut session = self.resume(token)?;
        let effects = session.undo();
        self.apply(effects)?;
        self.render(session)
    }

    /// Terminal action: mark the current record viewed, commit any staged
    /// deletion, and end without fetching another record.
    pub fn finish(&self, token: Option<&str>) -> Result<ReviewView> {
        let mut session = self.resume(token)?;
        let effects = session.finish();
        self.apply(effects)?;
        Ok(ReviewView {
            token: token::encode(&session),
            session,
            record: None,
            is_last: false,
            done: true,
            pending_delete: false,
        })
    }
}
