use serde::{Deserialize, Serialize};

/// Frame count assumed when the keyframe probe fails or reports zero.
pub const DEFAULT_SAMPLE_FRAMES: u64 = 100;

/// Extension appended to a source filename to name its mosaic.
pub const MOSAIC_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    pub cols: u32,
    pub rows: u32,
}

impl GridSpec {
    pub fn new(cols: u32, rows: u32) -> Self {
        GridSpec { cols, rows }
    }

    pub fn cells(&self) -> u64 {
        u64::from(self.cols) * u64::from(self.rows)
    }

    /// `tile` filter layout argument, e.g. `8x4`.
    pub fn layout(&self) -> String {
        format!("{}x{}", self.cols, self.rows)
    }
}

/// Frames to probe with, falling back to [`DEFAULT_SAMPLE_FRAMES`] when the
/// probe gave nothing usable.
pub fn effective_sample_frames(probed: Option<u64>) -> u64 {
    match probed {
        Some(n) if n > 0 => n,
        _ => DEFAULT_SAMPLE_FRAMES,
    }
}

/// Spacing between selected frames so the grid is filled evenly across the
/// whole clip. Never below 1.
pub fn sampling_interval(sampleable_frames: u64, grid: GridSpec) -> u64 {
    let cells = grid.cells().max(1);
    (sampleable_frames / cells).max(1)
}

/// Mosaic file name for a source file. The full source name is kept so that
/// `clip.mp4` and `clip.mkv` do not collide.
pub fn mosaic_file_name(filename: &str) -> String {
    format!("{}.{}", filename, MOSAIC_EXTENSION)
}

/// Strip any directory components from a caller supplied name.
///
/// Both separators are honoured regardless of platform. Returns `None` for
/// names that are empty or refer to a directory (`.`/`..`).
pub fn bare_filename(input: &str) -> Option<&str> {
    let name = input
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(input)
        .trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_spreads_frames_over_grid() {
        let grid = GridSpec::new(8, 4);
        assert_eq!(sampling_interval(320, grid), 10);
        assert_eq!(sampling_interval(335, grid), 10);
    }

    #[test]
    fn interval_never_drops_below_one() {
        let grid = GridSpec::new(8, 4);
        assert_eq!(sampling_interval(5, grid), 1);
        assert_eq!(sampling_interval(0, grid), 1);
    }

    #[test]
    fn failed_probe_uses_default_frames() {
        assert_eq!(effective_sample_frames(None), DEFAULT_SAMPLE_FRAMES);
        assert_eq!(effective_sample_frames(Some(0)), DEFAULT_SAMPLE_FRAMES);
        assert_eq!(effective_sample_frames(Some(42)), 42);
        // 8x4 grid with the fallback: 100 / 32
        assert_eq!(
            sampling_interval(effective_sample_frames(Some(0)), GridSpec::new(8, 4)),
            3
        );
    }

    #[test]
    fn bare_filename_strips_paths() {
        assert_eq!(bare_filename("Show/ep01.mp4"), Some("ep01.mp4"));
        assert_eq!(bare_filename("C:\\media\\Show\\ep01.mp4"), Some("ep01.mp4"));
        assert_eq!(bare_filename("ep01.mp4"), Some("ep01.mp4"));
        assert_eq!(bare_filename("/abs/path/ep01.mp4"), Some("ep01.mp4"));
    }

    #[test]
    fn bare_filename_rejects_directories() {
        assert_eq!(bare_filename(""), None);
        assert_eq!(bare_filename("Show/"), None);
        assert_eq!(bare_filename("../.."), None);
        assert_eq!(bare_filename("   "), None);
    }

    #[test]
    fn mosaic_name_keeps_source_extension() {
        assert_eq!(mosaic_file_name("clip.mp4"), "clip.mp4.jpg");
        assert_ne!(mosaic_file_name("clip.mp4"), mosaic_file_name("clip.mkv"));
    }
}
