use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ScanError;
use crate::jobs::Scanner;

/// Runs scans on a fixed interval until cancelled.
pub struct ScanScheduler {
    scanner: Arc<Scanner>,
    interval: Duration,
}

impl ScanScheduler {
    pub fn new(scanner: Arc<Scanner>, interval: Duration) -> Self {
        ScanScheduler { scanner, interval }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "periodic scanning enabled");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.scanner.scan(cancel.child_token()).await {
                Ok(_) => {}
                Err(ScanError::AlreadyRunning) => {
                    debug!("scan already in progress, skipping scheduled run");
                }
                Err(e) => error!(error = %e, "scheduled scan failed"),
            }
        }
    }
}
