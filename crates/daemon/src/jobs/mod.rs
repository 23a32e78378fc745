pub mod processor;
pub mod queue;
pub mod reconcile;
pub mod scanner;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub use reconcile::ReconcileSummary;
pub use scanner::Scanner;

/// Filesystem layout and tuning shared by the scanner and reconciliation.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub input_dir: PathBuf,
    pub mosaic_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Lowercase, without the leading dot.
    pub extensions: HashSet<String>,
    pub max_parallel: usize,
    pub import_existing: bool,
    pub disable_queue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Idle,
    Running,
}

/// Two-state guard that allows at most one scan at a time.
///
/// The only way to flip it to Running is [`ScanGuard::try_begin`], which
/// hands back a ticket; dropping the ticket returns the guard to Idle on
/// every exit path, including errors, cancellation and panics.
#[derive(Debug, Clone)]
pub struct ScanGuard {
    state: Arc<Mutex<ScanState>>,
}

#[derive(Debug)]
pub struct ScanTicket {
    state: Arc<Mutex<ScanState>>,
}

impl ScanGuard {
    pub fn new() -> Self {
        ScanGuard {
            state: Arc::new(Mutex::new(ScanState::Idle)),
        }
    }

    pub fn try_begin(&self) -> Option<ScanTicket> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ScanState::Running => None,
            ScanState::Idle => {
                *state = ScanState::Running;
                Some(ScanTicket {
                    state: self.state.clone(),
                })
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state == ScanState::Running
    }
}

impl Default for ScanGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanTicket {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = ScanState::Idle;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub processed: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub reconcile: ReconcileSummary,
}

/// Outcome of the most recent scan, kept for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub finished_at: DateTime<Utc>,
    pub summary: Option<ScanSummary>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_admits_one_scan() {
        let guard = ScanGuard::new();
        let ticket = guard.try_begin().unwrap();
        assert!(guard.is_running());
        assert!(guard.try_begin().is_none());
        drop(ticket);
        assert!(!guard.is_running());
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn clones_share_state() {
        let guard = ScanGuard::new();
        let other = guard.clone();
        let _ticket = guard.try_begin().unwrap();
        assert!(other.try_begin().is_none());
    }
}
