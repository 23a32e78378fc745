pub mod ffmpeg;

use async_trait::async_trait;
use engine::grid::{effective_sample_frames, sampling_interval};
use engine::GridSpec;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GenerateError;
use ffmpeg::FFmpegWrapper;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MediaMetadata {
    pub width: i64,
    pub height: i64,
    pub duration_seconds: f64,
}

/// Produces a mosaic for one media file.
#[async_trait]
pub trait MosaicGenerator: Send + Sync {
    /// Duration and resolution only. Used by import mode.
    async fn probe(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, GenerateError>;

    /// Write the mosaic for `source` to `output`. On success `output` exists
    /// and is non-empty.
    async fn generate(
        &self,
        source: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, GenerateError>;
}

pub struct FfmpegGenerator {
    pub ffmpeg: FFmpegWrapper,
    pub grid: GridSpec,
    pub tile_width: u32,
}

#[async_trait]
impl MosaicGenerator for FfmpegGenerator {
    async fn probe(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, GenerateError> {
        self.ffmpeg.probe(source, cancel).await
    }

    async fn generate(
        &self,
        source: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, GenerateError> {
        let probed = match self.ffmpeg.count_keyframes(source, cancel).await {
            Ok(count) => count,
            Err(GenerateError::Cancelled) => return Err(GenerateError::Cancelled),
            Err(e) => {
                debug!(source = %source.display(), error = %e, "keyframe probe failed");
                None
            }
        };
        let interval = sampling_interval(effective_sample_frames(probed), self.grid);

        let partial = partial_path(output);
        let composed = self
            .ffmpeg
            .compose_mosaic(source, &partial, interval, self.grid, self.tile_width, cancel)
            .await;
        if let Err(e) = composed {
            discard(&partial).await;
            return Err(e);
        }
        finalize_output(&partial, output).await?;

        match self.ffmpeg.probe(source, cancel).await {
            Ok(meta) => Ok(meta),
            Err(GenerateError::Cancelled) => Err(GenerateError::Cancelled),
            Err(e) => {
                warn!(source = %source.display(), error = %e, "metadata probe failed after mosaic");
                Ok(MediaMetadata::default())
            }
        }
    }
}

/// Sibling path the tool writes to before the result is moved into place.
/// Keeps the mosaic extension so leftovers are swept up as orphans.
pub fn partial_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(
        ".{}.partial.{}",
        name,
        engine::grid::MOSAIC_EXTENSION
    ))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial mosaic");
        }
    }
}

/// Confirm the tool really produced something, then rename it to its final
/// name. A missing or empty file is an error even if the tool exited cleanly.
pub async fn finalize_output(partial: &Path, output: &Path) -> Result<(), GenerateError> {
    let size = match tokio::fs::metadata(partial).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    };
    if size == 0 {
        discard(partial).await;
        return Err(GenerateError::EmptyOutput(output.to_path_buf()));
    }
    tokio::fs::rename(partial, output).await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_path_is_hidden_sibling() {
        let partial = partial_path(Path::new("/m/clip.mp4.jpg"));
        assert_eq!(partial, PathBuf::from("/m/.clip.mp4.jpg.partial.jpg"));
    }

    #[tokio::test]
    async fn reported_success_without_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("clip.mp4.jpg");
        let err = finalize_output(&partial_path(&out), &out).await.unwrap_err();
        assert!(matches!(err, GenerateError::EmptyOutput(_)));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn empty_output_is_an_error_and_removed() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("clip.mp4.jpg");
        let partial = partial_path(&out);
        std::fs::write(&partial, b"").unwrap();
        let err = finalize_output(&partial, &out).await.unwrap_err();
        assert!(matches!(err, GenerateError::EmptyOutput(_)));
        assert!(!partial.exists());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn non_empty_output_is_moved_into_place() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("clip.mp4.jpg");
        let partial = partial_path(&out);
        std::fs::write(&partial, b"jpeg").unwrap();
        finalize_output(&partial, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"jpeg");
        assert!(!partial.exists());
    }
}
