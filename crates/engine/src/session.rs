//! Review session state.
//!
//! The session is held by the client between requests; the service only
//! validates and advances it. Transitions here are pure: each returns the
//! store writes the caller must apply, so the undo rules can be tested
//! without a database.

use serde::{Deserialize, Serialize};

pub const SESSION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSession {
    pub version: u32,
    pub total_unreviewed: u64,
    pub viewed_count: u64,
    pub navigation_count: u64,
    pub current_record_id: i64,
    pub previous_record_id: i64,
    pub next_record_id: i64,
    /// Record whose deletion is staged but not yet written to the store.
    pub pending_delete_id: i64,
    #[serde(default)]
    pub pending_delete_bytes: u64,
    pub deleted_bytes_this_session: u64,
    /// Unix seconds.
    pub started_at: i64,
}

/// Durable writes implied by a session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    MarkViewed(i64),
    UnmarkViewed(i64),
    CommitDelete(i64),
}

impl ReviewSession {
    pub fn new(total_unreviewed: u64, started_at: i64) -> Self {
        ReviewSession {
            version: SESSION_VERSION,
            total_unreviewed,
            viewed_count: 0,
            navigation_count: 0,
            current_record_id: 0,
            previous_record_id: 0,
            next_record_id: 0,
            pending_delete_id: 0,
            pending_delete_bytes: 0,
            deleted_bytes_this_session: 0,
            started_at,
        }
    }

    pub fn has_pending_delete(&self) -> bool {
        self.pending_delete_id != 0
    }

    /// Ids that must not be served as the speculative next pick.
    pub fn exclusions(&self) -> Vec<i64> {
        [
            self.current_record_id,
            self.previous_record_id,
            self.pending_delete_id,
        ]
        .into_iter()
        .filter(|id| *id != 0)
        .collect()
    }

    pub fn show(&mut self, record_id: i64) {
        self.current_record_id = record_id;
    }

    pub fn set_next(&mut self, next: Option<i64>) {
        self.next_record_id = next.unwrap_or(0);
    }

    fn take_pending(&mut self, effects: &mut Vec<SessionEffect>) {
        if self.pending_delete_id != 0 {
            effects.push(SessionEffect::CommitDelete(self.pending_delete_id));
            self.pending_delete_id = 0;
            self.pending_delete_bytes = 0;
        }
    }

    fn advance(&mut self, next: Option<i64>) {
        self.previous_record_id = self.current_record_id;
        self.current_record_id = next.unwrap_or(0);
        self.next_record_id = 0;
        self.viewed_count += 1;
        self.navigation_count += 1;
    }

    /// Keep the current record and move on to `next`.
    pub fn keep(&mut self, next: Option<i64>) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.current_record_id == 0 {
            return effects;
        }
        self.take_pending(&mut effects);
        effects.push(SessionEffect::MarkViewed(self.current_record_id));
        self.advance(next);
        effects
    }

    /// Stage deletion of the current record and move on to `next`.
    ///
    /// A deletion staged earlier is committed first, so at most one deletion
    /// is ever held back.
    pub fn stage_delete(&mut self, next: Option<i64>, size_bytes: u64) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.current_record_id == 0 {
            return effects;
        }
        self.take_pending(&mut effects);
        self.pending_delete_id = self.current_record_id;
        self.pending_delete_bytes = size_bytes;
        self.deleted_bytes_this_session += size_bytes;
        self.advance(next);
        effects
    }

    /// Single-level undo.
    ///
    /// A staged deletion is dropped without touching the store. Otherwise the
    /// previously kept record is un-viewed. Either way the previous record is
    /// shown again and forgotten, so a second undo does nothing.
    pub fn undo(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.pending_delete_id != 0 {
            self.deleted_bytes_this_session = self
                .deleted_bytes_this_session
                .saturating_sub(self.pending_delete_bytes);
            self.pending_delete_id = 0;
            self.pending_delete_bytes = 0;
        } else if self.previous_record_id != 0 {
            effects.push(SessionEffect::UnmarkViewed(self.previous_record_id));
        } else {
            return effects;
        }

        if self.previous_record_id != 0 {
            self.next_record_id = self.current_record_id;
            self.current_record_id = self.previous_record_id;
            self.previous_record_id = 0;
            self.viewed_count = self.viewed_count.saturating_sub(1);
            self.navigation_count += 1;
        }
        effects
    }

    /// Terminal action for the last record: mark it viewed, commit any
    /// staged deletion and end the pass.
    pub fn finish(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        self.take_pending(&mut effects);
        if self.current_record_id != 0 {
            effects.push(SessionEffect::MarkViewed(self.current_record_id));
            self.advance(None);
        }
        effects
    }
}
