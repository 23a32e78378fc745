use anyhow::Result;
use chrono::Utc;
use engine::grid::mosaic_file_name;
use engine::{MediaSource, MediaStatus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Database, RecordUpdate};
use crate::error::{GenerateError, ScanError};
use crate::jobs::{reconcile, ScanGuard, ScanReport, ScanSummary, ScanTicket, ScannerSettings};
use crate::media::{MediaMetadata, MosaicGenerator};

#[derive(Debug, Clone)]
struct Candidate {
    filename: String,
    path: PathBuf,
    size: i64,
}

#[derive(Debug, Clone)]
struct WorkItem {
    candidate: Candidate,
    import: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Generated,
    Imported,
    Failed,
    Cancelled,
    /// The record was queued for deletion or archival while we worked.
    Superseded,
}

pub struct Scanner {
    db: Arc<Database>,
    generator: Arc<dyn MosaicGenerator>,
    settings: ScannerSettings,
    guard: ScanGuard,
    last_report: Mutex<Option<ScanReport>>,
}

impl Scanner {
    pub fn new(
        db: Arc<Database>,
        generator: Arc<dyn MosaicGenerator>,
        settings: ScannerSettings,
    ) -> Self {
        Scanner {
            db,
            generator,
            settings,
            guard: ScanGuard::new(),
            last_report: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    pub fn last_report(&self) -> Option<ScanReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run a full scan followed by reconciliation.
    pub async fn scan(&self, cancel: CancellationToken) -> Result<ScanSummary, ScanError> {
        let ticket = self.guard.try_begin().ok_or(ScanError::AlreadyRunning)?;
        self.run(ticket, cancel).await
    }

    /// Start a scan in the background. Returns false, without side effects,
    /// when one is already in flight.
    pub fn spawn_scan(self: &Arc<Self>, cancel: CancellationToken) -> bool {
        let Some(ticket) = self.guard.try_begin() else {
            return false;
        };
        let scanner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scanner.run(ticket, cancel).await {
                error!(error = %e, "scan failed");
            }
        });
        true
    }

    async fn run(
        &self,
        _ticket: ScanTicket,
        cancel: CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        let result = self.scan_inner(&cancel).await;
        let report = ScanReport {
            finished_at: Utc::now(),
            summary: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
        result
    }

    async fn scan_inner(&self, cancel: &CancellationToken) -> Result<ScanSummary, ScanError> {
        let candidates = discover(&self.settings).await?;
        info!(
            root = %self.settings.input_dir.display(),
            candidates = candidates.len(),
            "scan started"
        );

        let mut summary = ScanSummary::default();
        let mut work = Vec::new();
        for candidate in candidates {
            match self.plan(candidate)? {
                Some(item) => work.push(item),
                None => summary.skipped += 1,
            }
        }

        self.dispatch(work, cancel, &mut summary).await;

        summary.reconcile = reconcile::reconcile(&self.db, &self.settings, cancel).await?;
        summary.cancelled = cancel.is_cancelled();

        info!(
            processed = summary.processed,
            imported = summary.imported,
            skipped = summary.skipped,
            errors = summary.errors,
            cancelled = summary.cancelled,
            removed_missing = summary.reconcile.removed_missing,
            removed_orphans = summary.reconcile.removed_orphan_mosaics,
            processed_queue = summary.reconcile.processed_queue(),
            "scan finished"
        );
        Ok(summary)
    }

    /// Decide whether a discovered file needs work. `None` means skip.
    fn plan(&self, candidate: Candidate) -> Result<Option<WorkItem>> {
        let mosaic = self.settings.mosaic_dir.join(mosaic_file_name(&candidate.filename));
        let existing = self.db.get_by_filename(&candidate.filename)?;

        if let Some(record) = &existing {
            if record.status.is_queued() {
                return Ok(None);
            }
            if record.status == MediaStatus::Success
                && !record.mosaic_path.is_empty()
                && self.settings.mosaic_dir.join(&record.mosaic_path).is_file()
            {
                return Ok(None);
            }
        }

        let import = self.settings.import_existing && mosaic.is_file();
        Ok(Some(WorkItem { candidate, import }))
    }

    async fn dispatch(
        &self,
        work: Vec<WorkItem>,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) {
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let abort = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();

        for item in work {
            if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                break;
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if abort.load(Ordering::SeqCst) {
                break;
            }

            let db = self.db.clone();
            let generator = self.generator.clone();
            let mosaic_dir = self.settings.mosaic_dir.clone();
            let cancel = cancel.clone();
            let abort = abort.clone();
            workers.spawn(async move {
                let _permit = permit;
                let filename = item.candidate.filename.clone();
                let result =
                    process_item(&db, generator.as_ref(), &mosaic_dir, item, &cancel).await;
                if let Err(e) = &result {
                    error!(filename = %filename, error = %e, "store write failed, stopping dispatch");
                    abort.store(true, Ordering::SeqCst);
                }
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(ItemOutcome::Generated)) => summary.processed += 1,
                Ok(Ok(ItemOutcome::Imported)) => {
                    summary.processed += 1;
                    summary.imported += 1;
                }
                Ok(Ok(ItemOutcome::Superseded)) => summary.skipped += 1,
                Ok(Ok(ItemOutcome::Cancelled)) => {}
                Ok(Ok(ItemOutcome::Failed)) | Ok(Err(_)) => summary.errors += 1,
                Err(e) => {
                    error!(error = %e, "scan worker panicked");
                    summary.errors += 1;
                }
            }
        }
    }
}

/// Regular files directly under the input root with an allowed extension.
async fn discover(settings: &ScannerSettings) -> Result<Vec<Candidate>, ScanError> {
    let root = &settings.input_dir;
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| ScanError::RootUnreadable(root.clone(), e))?;

    let mut candidates = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(ScanError::RootUnreadable(root.clone(), e)),
        };
        let path = entry.path();
        if !has_allowed_extension(&path, settings) {
            continue;
        }
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat candidate");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            warn!(path = %path.display(), "skipping non UTF-8 filename");
            continue;
        };
        candidates.push(Candidate {
            filename,
            path,
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        });
    }
    Ok(candidates)
}

fn has_allowed_extension(path: &Path, settings: &ScannerSettings) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| settings.extensions.contains(&ext.to_lowercase()))
        .unwrap_or(false)
}

/// Generate (or import) one file and write its final record. Only store
/// failures are returned as errors; generator failures become Error rows.
async fn process_item(
    db: &Database,
    generator: &dyn MosaicGenerator,
    mosaic_dir: &Path,
    item: WorkItem,
    cancel: &CancellationToken,
) -> Result<ItemOutcome> {
    let Candidate {
        filename,
        path,
        size,
    } = item.candidate;
    let mosaic_name = mosaic_file_name(&filename);

    if item.import {
        let meta = match generator.probe(&path, cancel).await {
            Ok(meta) => meta,
            Err(GenerateError::Cancelled) => return Ok(ItemOutcome::Cancelled),
            Err(e) => {
                warn!(filename = %filename, error = %e, "metadata probe failed during import");
                MediaMetadata::default()
            }
        };
        let update = success_update(&filename, &mosaic_name, size, meta, MediaSource::Imported);
        return Ok(match db.upsert(&update)? {
            Some(_) => {
                debug!(filename = %filename, "imported existing mosaic");
                ItemOutcome::Imported
            }
            None => ItemOutcome::Superseded,
        });
    }

    if db.upsert(&RecordUpdate::pending(&filename, size))?.is_none() {
        return Ok(ItemOutcome::Superseded);
    }

    let output = mosaic_dir.join(&mosaic_name);
    match generator.generate(&path, &output, cancel).await {
        Ok(meta) => {
            let update = success_update(&filename, &mosaic_name, size, meta, MediaSource::Generated);
            Ok(match db.upsert(&update)? {
                Some(_) => {
                    debug!(filename = %filename, "mosaic generated");
                    ItemOutcome::Generated
                }
                None => ItemOutcome::Superseded,
            })
        }
        // Left Pending; the next scan picks it up again.
        Err(GenerateError::Cancelled) => Ok(ItemOutcome::Cancelled),
        Err(e) => {
            warn!(filename = %filename, error = %e, "mosaic generation failed");
            db.upsert(&RecordUpdate::failed(&filename, size, e.to_string()))?;
            Ok(ItemOutcome::Failed)
        }
    }
}

fn success_update(
    filename: &str,
    mosaic_name: &str,
    size: i64,
    meta: MediaMetadata,
    source: MediaSource,
) -> RecordUpdate {
    RecordUpdate {
        filename: filename.to_string(),
        mosaic_path: mosaic_name.to_string(),
        status: MediaStatus::Success,
        width: meta.width,
        height: meta.height,
        duration_seconds: meta.duration_seconds,
        file_size_bytes: size,
        source,
        error_message: String::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::testing::FakeGenerator;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub db: Arc<Database>,
        pub settings: ScannerSettings,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let settings = ScannerSettings {
                input_dir: dir.path().join("input"),
                mosaic_dir: dir.path().join("mosaics"),
                archive_dir: dir.path().join("archive"),
                extensions: ["mp4", "mkv"].iter().map(|s| s.to_string()).collect(),
                max_parallel: 2,
                import_existing: false,
                disable_queue: false,
            };
            std::fs::create_dir_all(&settings.input_dir).unwrap();
            std::fs::create_dir_all(&settings.mosaic_dir).unwrap();
            Fixture {
                dir,
                db: Arc::new(Database::open_in_memory().unwrap()),
                settings,
            }
        }

        pub fn source(&self, name: &str) -> PathBuf {
            self.settings.input_dir.join(name)
        }

        pub fn mosaic(&self, name: &str) -> PathBuf {
            self.settings.mosaic_dir.join(mosaic_file_name(name))
        }

        pub fn add_source(&self, name: &str, bytes: &[u8]) {
            std::fs::write(self.source(name), bytes).unwrap();
        }

        pub fn scanner(&self, generator: Arc<FakeGenerator>) -> Scanner {
            Scanner::new(self.db.clone(), generator, self.settings.clone())
        }
    }

    #[tokio::test]
    async fn scan_generates_one_record_per_file() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"aaaa");
        fx.add_source("B.MKV", b"bb");
        fx.add_source("notes.txt", b"ignored");
        std::fs::create_dir_all(fx.source("nested.mp4")).unwrap();

        let generator = Arc::new(FakeGenerator::default());
        let summary = fx.scanner(generator.clone()).scan(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errors, 0);
        let records = fx.db.list(None).unwrap();
        let names: HashSet<_> = records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, HashSet::from(["a.mp4", "B.MKV"]));
        for record in &records {
            assert_eq!(record.status, MediaStatus::Success);
            assert!(!record.mosaic_path.is_empty());
            assert!(fx.mosaic(&record.filename).is_file());
        }
        let a = fx.db.get_by_filename("a.mp4").unwrap().unwrap();
        assert_eq!(a.file_size_bytes, 4);
        assert_eq!(a.width, 1920);
        assert_eq!(a.source, MediaSource::Generated);
    }

    #[tokio::test]
    async fn rescan_skips_successful_records_entirely() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"aaaa");
        let generator = Arc::new(FakeGenerator::default());
        let scanner = fx.scanner(generator.clone());

        scanner.scan(CancellationToken::new()).await.unwrap();
        let id = fx.db.get_by_filename("a.mp4").unwrap().unwrap().id;
        fx.db.mark_viewed(id).unwrap();
        let before = fx.db.get_by_id(id).unwrap().unwrap();

        let summary = scanner.scan(CancellationToken::new()).await.unwrap();
        let after = fx.db.get_by_id(id).unwrap().unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(generator.generated(), 1);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.viewed);
    }

    #[tokio::test]
    async fn missing_mosaic_is_regenerated() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"aaaa");
        let generator = Arc::new(FakeGenerator::default());
        let scanner = fx.scanner(generator.clone());
        scanner.scan(CancellationToken::new()).await.unwrap();

        std::fs::remove_file(fx.mosaic("a.mp4")).unwrap();
        let summary = scanner.scan(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(generator.generated(), 2);
        assert!(fx.mosaic("a.mp4").is_file());
    }

    #[tokio::test]
    async fn generation_failure_is_recorded_and_retried() {
        let fx = Fixture::new();
        fx.add_source("good.mp4", b"g");
        fx.add_source("bad.mp4", b"b");
        let generator = Arc::new(FakeGenerator::failing(&["bad.mp4"]));
        let scanner = fx.scanner(generator.clone());

        let summary = scanner.scan(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.errors, 1);
        let bad = fx.db.get_by_filename("bad.mp4").unwrap().unwrap();
        assert_eq!(bad.status, MediaStatus::Error);
        assert!(bad.error_message.contains("ffmpeg"));
        assert!(bad.mosaic_path.is_empty());

        generator.fail.lock().unwrap().clear();
        scanner.scan(CancellationToken::new()).await.unwrap();
        let bad = fx.db.get_by_filename("bad.mp4").unwrap().unwrap();
        assert_eq!(bad.status, MediaStatus::Success);
        assert!(bad.error_message.is_empty());
    }

    #[tokio::test]
    async fn queued_records_are_not_regenerated() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"a");
        let generator = Arc::new(FakeGenerator::default());
        let mut settings = fx.settings.clone();
        settings.disable_queue = true;
        let scanner = Scanner::new(fx.db.clone(), generator.clone(), settings);

        scanner.scan(CancellationToken::new()).await.unwrap();
        fx.db.transition_by_filename("a.mp4", MediaStatus::Deleted).unwrap();
        std::fs::remove_file(fx.mosaic("a.mp4")).unwrap();

        scanner.scan(CancellationToken::new()).await.unwrap();
        assert_eq!(generator.generated(), 1);
        let record = fx.db.get_by_filename("a.mp4").unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Deleted);
    }

    #[tokio::test]
    async fn import_mode_adopts_existing_mosaic() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"aaaa");
        std::fs::write(fx.mosaic("a.mp4"), b"old mosaic").unwrap();
        let mut settings = fx.settings.clone();
        settings.import_existing = true;
        let generator = Arc::new(FakeGenerator::default());
        let scanner = Scanner::new(fx.db.clone(), generator.clone(), settings);

        let summary = scanner.scan(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(generator.generated(), 0);
        let record = fx.db.get_by_filename("a.mp4").unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Success);
        assert_eq!(record.source, MediaSource::Imported);
        assert_eq!(record.width, 640);
        assert_eq!(std::fs::read(fx.mosaic("a.mp4")).unwrap(), b"old mosaic");
    }

    #[tokio::test]
    async fn second_scan_is_rejected_while_running() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"a");
        let generator = Arc::new(FakeGenerator::slow(Duration::from_millis(200)));
        let scanner = Arc::new(fx.scanner(generator));

        let cancel = CancellationToken::new();
        assert!(scanner.spawn_scan(cancel.clone()));
        assert!(scanner.is_running());
        assert!(!scanner.spawn_scan(cancel.clone()));
        assert!(matches!(
            scanner.scan(cancel.clone()).await,
            Err(ScanError::AlreadyRunning)
        ));

        for _ in 0..100 {
            if !scanner.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!scanner.is_running());
        assert!(scanner.last_report().unwrap().summary.is_some());
    }

    #[tokio::test]
    async fn store_failure_stops_dispatch_but_lets_started_work_finish() {
        let mut fx = Fixture::new();
        fx.settings.max_parallel = 2;
        for i in 0..5 {
            fx.add_source(&format!("clip{}.mp4", i), b"data");
        }
        let generator = Arc::new(FakeGenerator::slow(Duration::from_millis(150)));
        let scanner = fx.scanner(generator.clone());

        // both workers have written their Pending rows; their final writes fail
        let break_store = async {
            while fx.db.list(None).unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            fx.db.set_read_only(true).unwrap();
        };
        let (summary, ()) = tokio::join!(scanner.scan(CancellationToken::new()), break_store);
        let summary = summary.unwrap();

        assert_eq!(summary.errors, 2);
        assert_eq!(summary.processed, 0);
        assert_eq!(generator.generated(), 2);
        let records = fx.db.list(None).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == MediaStatus::Pending));

        fx.db.set_read_only(false).unwrap();
        let summary = scanner.scan(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.processed, 5);
    }

    #[tokio::test]
    async fn cancellation_leaves_work_pending() {
        let fx = Fixture::new();
        for name in ["a.mp4", "b.mp4", "c.mp4", "d.mp4"] {
            fx.add_source(name, b"x");
        }
        let generator = Arc::new(FakeGenerator::slow(Duration::from_secs(30)));
        let scanner = fx.scanner(generator.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let summary = tokio::time::timeout(Duration::from_secs(5), scanner.scan(cancel))
            .await
            .expect("cancelled scan must return promptly")
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
        assert_eq!(generator.generated(), 0);
        // only the first batch was dispatched
        let records = fx.db.list(None).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == MediaStatus::Pending));
        assert!(!scanner.is_running());
    }

    #[tokio::test]
    async fn unreadable_root_fails_without_mutation() {
        let fx = Fixture::new();
        let mut settings = fx.settings.clone();
        settings.input_dir = fx.dir.path().join("does-not-exist");
        let scanner = Scanner::new(fx.db.clone(), Arc::new(FakeGenerator::default()), settings);

        let err = scanner.scan(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::RootUnreadable(..)));
        assert!(fx.db.list(None).unwrap().is_empty());
        assert!(!scanner.is_running());
        assert!(scanner.last_report().unwrap().error.is_some());
    }
}
