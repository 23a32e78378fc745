//! Aligns the store with the filesystem after a scan.
//!
//! Three passes run in order: the deletion/archival queue, rows whose source
//! vanished, and mosaics with no row. A failure on one item is logged and
//! counted; it never stops the pass. Cancellation is checked before every
//! item.

use anyhow::Result;
use engine::grid::{mosaic_file_name, MOSAIC_EXTENSION};
use engine::MediaStatus;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Database, MediaRecord};
use crate::jobs::ScannerSettings;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub deleted: usize,
    pub archived: usize,
    pub removed_missing: usize,
    pub removed_orphan_mosaics: usize,
    pub failures: usize,
    pub cancelled: bool,
}

impl ReconcileSummary {
    pub fn processed_queue(&self) -> usize {
        self.deleted + self.archived
    }
}

/// How far an archival got. `Copied` is the checkpoint where the archive
/// copy is verified but the original has not been removed yet; a crash there
/// leaves the record Archived with both files present and the next pass
/// resumes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePhase {
    Copied,
    Completed,
}

pub async fn reconcile(
    db: &Database,
    settings: &ScannerSettings,
    cancel: &CancellationToken,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    if settings.disable_queue {
        debug!("deletion queue disabled, skipping queue pass");
    } else {
        process_queue(db, settings, cancel, &mut summary).await?;
    }
    remove_missing_sources(db, settings, cancel, &mut summary).await?;
    remove_orphan_mosaics(db, settings, cancel, &mut summary).await?;

    summary.cancelled = cancel.is_cancelled();
    if summary.processed_queue() + summary.removed_missing + summary.removed_orphan_mosaics > 0 {
        info!(
            deleted = summary.deleted,
            archived = summary.archived,
            removed_missing = summary.removed_missing,
            removed_orphans = summary.removed_orphan_mosaics,
            failures = summary.failures,
            "reconciliation finished"
        );
    }
    Ok(summary)
}

/// `Ok(true)` if the path exists, `Ok(false)` if it definitely does not.
async fn exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success.
async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn mosaic_path_for(settings: &ScannerSettings, record: &MediaRecord) -> PathBuf {
    settings.mosaic_dir.join(mosaic_file_name(&record.filename))
}

async fn process_queue(
    db: &Database,
    settings: &ScannerSettings,
    cancel: &CancellationToken,
    summary: &mut ReconcileSummary,
) -> Result<()> {
    for record in db.list_by_status(MediaStatus::Deleted)? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match delete_record(db, settings, &record).await {
            Ok(()) => {
                info!(filename = %record.filename, "deleted");
                summary.deleted += 1;
            }
            Err(e) => {
                warn!(filename = %record.filename, error = %e, "deletion failed, will retry next pass");
                summary.failures += 1;
            }
        }
    }

    for record in db.list_by_status(MediaStatus::Archived)? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match archive_record(db, settings, &record).await {
            Ok(ArchivePhase::Completed) => {
                info!(filename = %record.filename, "archived");
                summary.archived += 1;
            }
            Ok(ArchivePhase::Copied) => {
                summary.failures += 1;
            }
            Err(e) => {
                warn!(filename = %record.filename, error = %e, "archival failed, original kept");
                summary.failures += 1;
            }
        }
    }
    Ok(())
}

/// Delete mosaic then source. The row goes only once the source is gone.
async fn delete_record(db: &Database, settings: &ScannerSettings, record: &MediaRecord) -> Result<()> {
    let mosaic = mosaic_path_for(settings, record);
    if let Err(e) = remove_if_present(&mosaic).await {
        // The orphan pass retries it once the row is gone.
        warn!(path = %mosaic.display(), error = %e, "failed to remove mosaic");
    }
    remove_if_present(&settings.input_dir.join(&record.filename)).await?;
    db.remove(record.id)?;
    Ok(())
}

/// Copy the source into the archive, confirm the copy, and only then remove
/// the original, the mosaic and the row.
pub async fn archive_record(
    db: &Database,
    settings: &ScannerSettings,
    record: &MediaRecord,
) -> Result<ArchivePhase> {
    let source = settings.input_dir.join(&record.filename);
    let dest = settings.archive_dir.join(&record.filename);

    if !exists(&source).await? {
        if exists(&dest).await? {
            // Original already removed by an earlier, interrupted pass.
            finish_archive(db, settings, record).await?;
            return Ok(ArchivePhase::Completed);
        }
        anyhow::bail!("source {} is missing and no archive copy exists", source.display());
    }

    copy_verified(&source, &dest).await?;

    if let Err(e) = tokio::fs::remove_file(&source).await {
        warn!(
            filename = %record.filename,
            error = %e,
            "archive copy verified but original could not be removed"
        );
        return Ok(ArchivePhase::Copied);
    }
    finish_archive(db, settings, record).await?;
    Ok(ArchivePhase::Completed)
}

async fn finish_archive(db: &Database, settings: &ScannerSettings, record: &MediaRecord) -> Result<()> {
    let mosaic = mosaic_path_for(settings, record);
    if let Err(e) = remove_if_present(&mosaic).await {
        warn!(path = %mosaic.display(), error = %e, "failed to remove mosaic");
    }
    db.remove(record.id)?;
    Ok(())
}

/// Copy `source` to `dest` through a temporary sibling and verify the size.
///
/// An existing `dest` with identical contents is taken as a finished copy
/// from an earlier pass. Any other existing `dest` is never overwritten, and
/// `dest` may not be `source` itself.
pub async fn copy_verified(source: &Path, dest: &Path) -> Result<()> {
    let expected = tokio::fs::metadata(source).await?.len();

    match tokio::fs::metadata(dest).await {
        Ok(_) if same_file(source, dest).await? => anyhow::bail!(
            "archive destination {} is the source itself",
            dest.display()
        ),
        Ok(meta) if meta.len() != expected => anyhow::bail!(
            "archive destination {} exists with a different size ({} != {})",
            dest.display(),
            meta.len(),
            expected
        ),
        Ok(_) => {
            if same_contents(source, dest).await? {
                return Ok(());
            }
            anyhow::bail!(
                "archive destination {} exists with different contents",
                dest.display()
            );
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = dest.with_file_name(format!(
        ".{}.partial",
        dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));

    let copied = match tokio::fs::copy(source, &partial).await {
        Ok(copied) => copied,
        Err(e) => {
            discard_partial(&partial).await;
            return Err(e.into());
        }
    };
    if copied != expected {
        discard_partial(&partial).await;
        anyhow::bail!("short copy of {}: {} of {} bytes", source.display(), copied, expected);
    }
    let file = tokio::fs::File::open(&partial).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&partial, dest).await?;

    let written = tokio::fs::metadata(dest).await?.len();
    if written != expected {
        anyhow::bail!("archive copy of {} has {} bytes, expected {}", source.display(), written, expected);
    }
    Ok(())
}

async fn discard_partial(partial: &Path) {
    if let Err(e) = remove_if_present(partial).await {
        warn!(path = %partial.display(), error = %e, "failed to remove partial archive copy");
    }
}

async fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(tokio::fs::canonicalize(a).await? == tokio::fs::canonicalize(b).await?)
}

/// Byte-for-byte comparison of two files already known to have equal length.
async fn same_contents(a: &Path, b: &Path) -> io::Result<bool> {
    use tokio::io::AsyncReadExt;

    let mut left = tokio::io::BufReader::new(tokio::fs::File::open(a).await?);
    let mut right = tokio::io::BufReader::new(tokio::fs::File::open(b).await?);
    let mut left_buf = vec![0u8; 64 * 1024];
    let mut right_buf = vec![0u8; 64 * 1024];
    loop {
        let n = left.read(&mut left_buf).await?;
        if n == 0 {
            // left is exhausted; right must be too
            return Ok(right.read(&mut right_buf[..1]).await? == 0);
        }
        match right.read_exact(&mut right_buf[..n]).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }
        if left_buf[..n] != right_buf[..n] {
            return Ok(false);
        }
    }
}

async fn remove_missing_sources(
    db: &Database,
    settings: &ScannerSettings,
    cancel: &CancellationToken,
    summary: &mut ReconcileSummary,
) -> Result<()> {
    for record in db.list(None)? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if record.status == MediaStatus::Deleted {
            continue;
        }
        let source = settings.input_dir.join(&record.filename);
        match exists(&source).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!(path = %source.display(), error = %e, "cannot check source, keeping record");
                summary.failures += 1;
                continue;
            }
        }

        let mosaic = mosaic_path_for(settings, &record);
        if let Err(e) = remove_if_present(&mosaic).await {
            warn!(path = %mosaic.display(), error = %e, "failed to remove mosaic of missing source");
            summary.failures += 1;
            continue;
        }
        db.remove(record.id)?;
        info!(filename = %record.filename, "source vanished, record removed");
        summary.removed_missing += 1;
    }
    Ok(())
}

async fn remove_orphan_mosaics(
    db: &Database,
    settings: &ScannerSettings,
    cancel: &CancellationToken,
    summary: &mut ReconcileSummary,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Ok(());
    }
    let mut entries = match tokio::fs::read_dir(&settings.mosaic_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let expected: HashSet<String> = db
        .filenames()?
        .iter()
        .map(|name| mosaic_file_name(name))
        .collect();

    while let Some(entry) = entries.next_entry().await? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let path = entry.path();
        let is_mosaic = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(MOSAIC_EXTENSION))
            .unwrap_or(false);
        if !is_mosaic || !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if expected.contains(&name) {
            continue;
        }
        match remove_if_present(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed orphan mosaic");
                summary.removed_orphan_mosaics += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove orphan mosaic");
                summary.failures += 1;
            }
        }
    }
    Ok(())
}
