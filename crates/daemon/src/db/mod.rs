use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use engine::{MediaSource, MediaStatus};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct Database {
    conn: Mutex<Connection>,
}

const RECORD_COLUMNS: &str = "id, filename, mosaic_path, status, viewed, width, height, \
     duration_seconds, file_size_bytes, source, error_message, created_at, updated_at";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS media_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                mosaic_path TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'success', 'error', 'deleted', 'archived')),
                viewed INTEGER NOT NULL DEFAULT 0,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                duration_seconds REAL NOT NULL DEFAULT 0,
                file_size_bytes INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'generated',
                error_message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_media_records_review
             ON media_records (status, viewed)",
            [],
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaRecord {
    pub id: i64,
    pub filename: String,
    pub mosaic_path: String,
    pub status: MediaStatus,
    pub viewed: bool,
    pub width: i64,
    pub height: i64,
    pub duration_seconds: f64,
    pub file_size_bytes: i64,
    pub source: MediaSource,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_column<T: std::str::FromStr>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl MediaRecord {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(MediaRecord {
            id: row.get(0)?,
            filename: row.get(1)?,
            mosaic_path: row.get(2)?,
            status: parse_column(row, 3)?,
            viewed: row.get::<_, i64>(4)? != 0,
            width: row.get(5)?,
            height: row.get(6)?,
            duration_seconds: row.get(7)?,
            file_size_bytes: row.get(8)?,
            source: parse_column(row, 9)?,
            error_message: row.get(10)?,
            created_at: parse_timestamp(row, 11)?,
            updated_at: parse_timestamp(row, 12)?,
        })
    }
}

/// Values written by a scan for one file. Zero metrics mean "not available"
/// and never overwrite a value already stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub filename: String,
    pub mosaic_path: String,
    pub status: MediaStatus,
    pub width: i64,
    pub height: i64,
    pub duration_seconds: f64,
    pub file_size_bytes: i64,
    pub source: MediaSource,
    pub error_message: String,
}

impl RecordUpdate {
    pub fn pending(filename: &str, file_size_bytes: i64) -> Self {
        RecordUpdate {
            filename: filename.to_string(),
            mosaic_path: String::new(),
            status: MediaStatus::Pending,
            width: 0,
            height: 0,
            duration_seconds: 0.0,
            file_size_bytes,
            source: MediaSource::Generated,
            error_message: String::new(),
        }
    }

    pub fn failed(filename: &str, file_size_bytes: i64, message: impl Into<String>) -> Self {
        RecordUpdate {
            status: MediaStatus::Error,
            error_message: message.into(),
            ..RecordUpdate::pending(filename, file_size_bytes)
        }
    }
}

/// Result of a status change requested through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Changed { id: i64, status: MediaStatus },
    NotFound,
    AlreadyInState(MediaStatus),
    Rejected(MediaStatus),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub pending: u64,
    pub success: u64,
    pub error: u64,
    pub deleted: u64,
    pub archived: u64,
    pub viewed: u64,
    pub unreviewed: u64,
    pub total_bytes: i64,
}

impl Database {
    pub fn get_by_id(&self, id: i64) -> Result<Option<MediaRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                MediaRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_by_filename(&self, filename: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE filename = ?1", RECORD_COLUMNS),
                params![filename],
                MediaRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or update the record for `update.filename`.
    ///
    /// Identity, `created_at` and `viewed` survive the rewrite, missing metrics
    /// keep their previous values and an `imported` source stays imported.
    /// Rows that are queued as Deleted or Archived are left alone and `None` is
    /// returned.
    pub fn upsert(&self, update: &RecordUpdate) -> Result<Option<i64>> {
        let now = now();
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "INSERT INTO media_records
                    (filename, mosaic_path, status, viewed, width, height, duration_seconds,
                     file_size_bytes, source, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(filename) DO UPDATE SET
                    mosaic_path = excluded.mosaic_path,
                    status = excluded.status,
                    width = CASE WHEN excluded.width > 0 THEN excluded.width ELSE media_records.width END,
                    height = CASE WHEN excluded.height > 0 THEN excluded.height ELSE media_records.height END,
                    duration_seconds = CASE WHEN excluded.duration_seconds > 0
                        THEN excluded.duration_seconds ELSE media_records.duration_seconds END,
                    file_size_bytes = CASE WHEN excluded.file_size_bytes > 0
                        THEN excluded.file_size_bytes ELSE media_records.file_size_bytes END,
                    source = CASE WHEN media_records.source = 'imported'
                        THEN 'imported' ELSE excluded.source END,
                    error_message = excluded.error_message,
                    updated_at = excluded.updated_at
                 WHERE media_records.status NOT IN ('deleted', 'archived')
                 RETURNING id",
                params![
                    update.filename,
                    update.mosaic_path,
                    update.status.as_str(),
                    update.width,
                    update.height,
                    update.duration_seconds,
                    update.file_size_bytes,
                    update.source.as_str(),
                    update.error_message,
                    now,
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn list(&self, status: Option<MediaStatus>) -> Result<Vec<MediaRecord>> {
        let conn = self.conn()?;
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM media_records WHERE status = ?1 ORDER BY filename",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str()], MediaRecord::from_row)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM media_records ORDER BY filename",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map([], MediaRecord::from_row)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    pub fn list_by_status(&self, status: MediaStatus) -> Result<Vec<MediaRecord>> {
        self.list(Some(status))
    }

    pub fn filenames(&self) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT filename FROM media_records")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = HashSet::new();
        for row in rows {
            names.insert(row?);
        }
        Ok(names)
    }

    pub fn count_unreviewed(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM media_records WHERE status = 'success' AND viewed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Uniformly random Success record that has not been viewed, skipping
    /// `exclude`.
    pub fn random_unreviewed(&self, exclude: &[i64]) -> Result<Option<MediaRecord>> {
        let conn = self.conn()?;
        let mut sql = format!(
            "SELECT {} FROM media_records WHERE status = 'success' AND viewed = 0",
            RECORD_COLUMNS
        );
        if !exclude.is_empty() {
            let placeholders = vec!["?"; exclude.len()].join(", ");
            sql.push_str(&format!(" AND id NOT IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY RANDOM() LIMIT 1");
        let record = conn
            .query_row(&sql, params_from_iter(exclude.iter()), MediaRecord::from_row)
            .optional()?;
        Ok(record)
    }

    /// Set `viewed` on a Success record. Returns false if the record is
    /// missing or not in Success.
    pub fn mark_viewed(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE media_records SET viewed = 1, updated_at = ?1
             WHERE id = ?2 AND status = 'success'",
            params![now(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn unmark_viewed(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE media_records SET viewed = 0, updated_at = ?1 WHERE id = ?2 AND viewed = 1",
            params![now(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn reset_viewed(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE media_records SET viewed = 0, updated_at = ?1 WHERE viewed = 1",
            params![now()],
        )?;
        Ok(changed)
    }

    pub fn transition_by_id(&self, id: i64, to: MediaStatus) -> Result<TransitionOutcome> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                MediaRecord::from_row,
            )
            .optional()?;
        Self::transition(&conn, record, to)
    }

    pub fn transition_by_filename(&self, filename: &str, to: MediaStatus) -> Result<TransitionOutcome> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE filename = ?1", RECORD_COLUMNS),
                params![filename],
                MediaRecord::from_row,
            )
            .optional()?;
        Self::transition(&conn, record, to)
    }

    /// Apply a queue or restore transition while the connection lock is held,
    /// so the read-check-write is atomic for other callers.
    fn transition(
        conn: &Connection,
        record: Option<MediaRecord>,
        to: MediaStatus,
    ) -> Result<TransitionOutcome> {
        let Some(record) = record else {
            return Ok(TransitionOutcome::NotFound);
        };
        if record.status == to {
            return Ok(TransitionOutcome::AlreadyInState(to));
        }
        if !record.status.can_transition_to(to) {
            return Ok(TransitionOutcome::Rejected(record.status));
        }

        // A restored record without a mosaic cannot be Success; send it back
        // through generation instead.
        let target = if to == MediaStatus::Success && record.mosaic_path.is_empty() {
            MediaStatus::Pending
        } else {
            to
        };

        conn.execute(
            "UPDATE media_records SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![target.as_str(), now(), record.id],
        )?;
        Ok(TransitionOutcome::Changed {
            id: record.id,
            status: target,
        })
    }

    /// Undo a queued deletion. Only Deleted records qualify; anything else
    /// is reported back unchanged.
    pub fn restore_deleted(&self, id: i64) -> Result<TransitionOutcome> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                MediaRecord::from_row,
            )
            .optional()?;
        match record {
            Some(record) if record.status != MediaStatus::Deleted => {
                Ok(TransitionOutcome::Rejected(record.status))
            }
            record => Self::transition(&conn, record, MediaStatus::Success),
        }
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM media_records WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Make every write fail, for exercising store failure paths.
    #[cfg(test)]
    pub(crate) fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.conn()?.pragma_update(None, "query_only", read_only)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let mut stats = StoreStats::default();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), SUM(viewed), SUM(CASE WHEN viewed = 0 THEN 1 ELSE 0 END),
                    COALESCE(SUM(file_size_bytes), 0)
             FROM media_records GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_column::<MediaStatus>(row, 0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (status, count, viewed, unviewed, bytes) = row?;
            let count = count.max(0) as u64;
            stats.total += count;
            stats.viewed += viewed.max(0) as u64;
            stats.total_bytes += bytes;
            match status {
                MediaStatus::Pending => stats.pending = count,
                MediaStatus::Success => {
                    stats.success = count;
                    stats.unreviewed = unviewed.max(0) as u64;
                }
                MediaStatus::Error => stats.error = count,
                MediaStatus::Deleted => stats.deleted = count,
                MediaStatus::Archived => stats.archived = count,
            }
        }
        Ok(stats)
    }
}
