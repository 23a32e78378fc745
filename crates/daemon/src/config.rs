use anyhow::{bail, Result};
use clap::Parser;
use engine::GridSpec;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::jobs::ScannerSettings;

const DEFAULT_EXTENSIONS: &str = "mp4,mkv,avi,mov,wmv,m4v,webm,flv,mpg,mpeg,ts";

#[derive(Debug, Clone, Parser)]
#[command(name = "mosaicd", about = "Thumbnail mosaic generator and review daemon")]
pub struct Config {
    /// Directory scanned for media files (not recursive)
    #[arg(long, env = "MOSAIC_INPUT_DIR")]
    pub input_dir: PathBuf,

    /// Where mosaics are written [default: <input_dir>/.mosaics]
    #[arg(long, env = "MOSAIC_OUTPUT_DIR")]
    pub mosaic_dir: Option<PathBuf>,

    /// Destination for archived sources [default: <input_dir>/archive]
    #[arg(long, env = "MOSAIC_ARCHIVE_DIR")]
    pub archive_dir: Option<PathBuf>,

    /// SQLite database file [default: <mosaic_dir>/mosaics.db]
    #[arg(long, env = "MOSAIC_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[arg(long, env = "MOSAIC_GRID_COLS", default_value_t = 8)]
    pub grid_cols: u32,

    #[arg(long, env = "MOSAIC_GRID_ROWS", default_value_t = 4)]
    pub grid_rows: u32,

    /// Width in pixels of each grid cell
    #[arg(long, env = "MOSAIC_TILE_WIDTH", default_value_t = 320)]
    pub tile_width: u32,

    /// Maximum concurrent generator runs
    #[arg(long, env = "MOSAIC_MAX_PARALLEL", default_value_t = 2)]
    pub max_parallel: usize,

    /// Comma separated list of media extensions
    #[arg(long, env = "MOSAIC_EXTENSIONS", default_value = DEFAULT_EXTENSIONS)]
    pub extensions: String,

    /// Adopt mosaics already on disk instead of regenerating them
    #[arg(long, env = "MOSAIC_IMPORT_EXISTING")]
    pub import_existing: bool,

    /// Leave Deleted/Archived records untouched during reconciliation
    #[arg(long, env = "MOSAIC_DISABLE_QUEUE")]
    pub disable_queue: bool,

    /// Seconds between background scans, 0 disables them
    #[arg(long, env = "MOSAIC_SCAN_INTERVAL", default_value_t = 0)]
    pub scan_interval_secs: u64,

    #[arg(long, env = "MOSAIC_SCAN_ON_START", default_value_t = true, action = clap::ArgAction::Set)]
    pub scan_on_start: bool,

    #[arg(long, env = "MOSAIC_BIND", default_value = "127.0.0.1:7777")]
    pub bind: SocketAddr,

    #[arg(long, env = "MOSAIC_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg_bin: String,

    #[arg(long, env = "MOSAIC_FFPROBE", default_value = "ffprobe")]
    pub ffprobe_bin: String,

    #[arg(long, env = "MOSAIC_PROBE_TIMEOUT", default_value_t = 60)]
    pub probe_timeout_secs: u64,

    #[arg(long, env = "MOSAIC_GENERATE_TIMEOUT", default_value_t = 600)]
    pub generate_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.grid_cols == 0 || self.grid_rows == 0 {
            bail!("grid dimensions must be non-zero, got {}x{}", self.grid_cols, self.grid_rows);
        }
        if self.tile_width == 0 {
            bail!("tile width must be non-zero");
        }
        if self.allowed_extensions().is_empty() {
            bail!("at least one media extension is required");
        }
        if same_dir(&self.archive_dir(), &self.input_dir) {
            bail!(
                "archive directory {} must differ from the input directory",
                self.archive_dir().display()
            );
        }
        Ok(())
    }

    pub fn grid(&self) -> GridSpec {
        GridSpec::new(self.grid_cols, self.grid_rows)
    }

    pub fn mosaic_dir(&self) -> PathBuf {
        self.mosaic_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join(".mosaics"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("archive"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.mosaic_dir().join("mosaics.db"))
    }

    pub fn allowed_extensions(&self) -> HashSet<String> {
        parse_extensions(&self.extensions)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            input_dir: self.input_dir.clone(),
            mosaic_dir: self.mosaic_dir(),
            archive_dir: self.archive_dir(),
            extensions: self.allowed_extensions(),
            max_parallel: self.max_parallel.max(1),
            import_existing: self.import_existing,
            disable_queue: self.disable_queue,
        }
    }
}

/// Resolved comparison when both paths exist, lexical otherwise.
fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Lowercased extensions without leading dots.
pub fn parse_extensions(list: &str) -> HashSet<String> {
    list.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
