use engine::GridSpec;
use serde::Deserialize;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GenerateError;
use crate::media::MediaMetadata;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<FormatInfo>,
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    codec_type: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    duration: Option<String>,
}

/// Thin async wrapper around the ffmpeg/ffprobe binaries.
///
/// Every invocation races the child process against the cancellation token
/// and a timeout. The child is spawned with `kill_on_drop`, so losing the
/// race terminates it.
#[derive(Debug, Clone)]
pub struct FFmpegWrapper {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub probe_timeout: Duration,
    pub generate_timeout: Duration,
}

impl FFmpegWrapper {
    async fn run(
        mut cmd: Command,
        what: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Output, GenerateError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tokio::select! {
            _ = cancel.cancelled() => Err(GenerateError::Cancelled),
            result = tokio::time::timeout(timeout, cmd.output()) => match result {
                Err(_) => Err(GenerateError::Timeout(what)),
                Ok(Err(e)) => Err(GenerateError::ToolFailed(format!(
                    "failed to execute {}: {}. Make sure FFmpeg is installed.",
                    what, e
                ))),
                Ok(Ok(output)) => Ok(output),
            },
        }
    }

    fn check(output: Output, what: &str) -> Result<Output, GenerateError> {
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim().lines().last().unwrap_or("no output");
        Err(GenerateError::ToolFailed(format!(
            "{} exited with {}: {}",
            what, output.status, detail
        )))
    }

    pub async fn probe(
        &self,
        media_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata, GenerateError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration:stream=codec_type,width,height,duration",
            "-of",
            "json",
        ])
        .arg(media_path);

        let output = Self::run(cmd, "ffprobe", self.probe_timeout, cancel).await?;
        let output = Self::check(output, "ffprobe")?;
        parse_probe_output(&output.stdout)
    }

    /// Number of keyframes in the first video stream, `None` if ffprobe could
    /// not tell.
    pub async fn count_keyframes(
        &self,
        media_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, GenerateError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-skip_frame",
            "nokey",
            "-count_frames",
            "-show_entries",
            "stream=nb_read_frames",
            "-of",
            "default=nokey=1:noprint_wrappers=1",
        ])
        .arg(media_path);

        let output = Self::run(cmd, "ffprobe", self.probe_timeout, cancel).await?;
        let output = Self::check(output, "ffprobe")?;
        Ok(parse_frame_count(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Compose one mosaic image from every `interval`-th keyframe.
    pub async fn compose_mosaic(
        &self,
        input_path: &Path,
        output_path: &Path,
        interval: u64,
        grid: GridSpec,
        tile_width: u32,
        cancel: &CancellationToken,
    ) -> Result<(), GenerateError> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let filter = mosaic_filter(interval, grid, tile_width);
        debug!(input = %input_path.display(), %filter, "composing mosaic");

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-skip_frame", "nokey", "-i"])
            .arg(input_path)
            .args(["-an", "-vf", &filter, "-frames:v", "1", "-q:v", "3", "-update", "1", "-y"])
            .arg(output_path);

        let output = Self::run(cmd, "ffmpeg", self.generate_timeout, cancel).await?;
        Self::check(output, "ffmpeg")?;
        Ok(())
    }
}

pub(crate) fn mosaic_filter(interval: u64, grid: GridSpec, tile_width: u32) -> String {
    format!(
        "select=not(mod(n\\,{})),scale={}:-1,tile={}",
        interval.max(1),
        tile_width,
        grid.layout()
    )
}

pub(crate) fn parse_frame_count(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .next()
}

pub(crate) fn parse_probe_output(stdout: &[u8]) -> Result<MediaMetadata, GenerateError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| GenerateError::ToolFailed(format!("unreadable ffprobe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let duration_seconds = probe
        .format
        .and_then(|f| f.duration)
        .or_else(|| video.and_then(|v| v.duration.clone()))
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);

    Ok(MediaMetadata {
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        duration_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_escapes_select_comma() {
        let filter = mosaic_filter(3, GridSpec::new(8, 4), 320);
        assert_eq!(filter, "select=not(mod(n\\,3)),scale=320:-1,tile=8x4");
    }

    #[test]
    fn frame_count_ignores_non_numeric_output() {
        assert_eq!(parse_frame_count("125\n"), Some(125));
        assert_eq!(parse_frame_count("N/A\n"), None);
        assert_eq!(parse_frame_count(""), None);
    }

    #[test]
    fn probe_output_reads_video_stream() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 1280, "height": 720}
            ],
            "format": {"duration": "120.500000"}
        }"#;
        let meta = parse_probe_output(json).unwrap();
        assert_eq!(meta.width, 1280);
        assert_eq!(meta.height, 720);
        assert_eq!(meta.duration_seconds, 120.5);
    }

    #[test]
    fn probe_output_without_video_has_zero_metrics() {
        let meta = parse_probe_output(br#"{"streams": [], "format": {}}"#).unwrap();
        assert_eq!(meta, MediaMetadata::default());
    }

    #[test]
    fn garbage_probe_output_is_an_error() {
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[cfg(target_os = "linux")]
    mod process_lifetime {
        use crate::error::GenerateError;
        use crate::media::ffmpeg::FFmpegWrapper;
        use engine::GridSpec;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use std::time::{Duration, Instant};
        use tempfile::TempDir;
        use tokio_util::sync::CancellationToken;

        /// A stand-in for ffprobe that records its pid and then hangs.
        fn hanging_tool(dir: &TempDir) -> (PathBuf, PathBuf) {
            let pid_file = dir.path().join("tool.pid");
            let script = dir.path().join("hang.sh");
            std::fs::write(
                &script,
                format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            (script, pid_file)
        }

        fn wrapper(tool: &Path, probe_timeout: Duration) -> FFmpegWrapper {
            FFmpegWrapper {
                ffmpeg_bin: tool.display().to_string(),
                ffprobe_bin: tool.display().to_string(),
                probe_timeout,
                generate_timeout: Duration::from_secs(60),
            }
        }

        async fn read_pid(pid_file: &Path) -> u32 {
            for _ in 0..500 {
                if let Ok(text) = std::fs::read_to_string(pid_file) {
                    if let Ok(pid) = text.trim().parse() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("tool never started");
        }

        /// Gone means no /proc entry, or a zombie awaiting reaping.
        async fn wait_until_gone(pid: u32) -> bool {
            for _ in 0..500 {
                match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                    Err(_) => return true,
                    Ok(stat) => {
                        let state = stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next());
                        if state == Some("Z") {
                            return true;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        }

        #[tokio::test]
        async fn cancellation_kills_the_child() {
            let dir = TempDir::new().unwrap();
            let (tool, pid_file) = hanging_tool(&dir);
            let ffmpeg = wrapper(&tool, Duration::from_secs(60));
            let cancel = CancellationToken::new();

            let started = Instant::now();
            let trigger = async {
                let pid = read_pid(&pid_file).await;
                cancel.cancel();
                pid
            };
            let (result, pid) = tokio::join!(ffmpeg.probe(Path::new("clip.mp4"), &cancel), trigger);

            assert!(matches!(result, Err(GenerateError::Cancelled)));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(wait_until_gone(pid).await);
        }

        #[tokio::test]
        async fn timeout_kills_the_child() {
            let dir = TempDir::new().unwrap();
            let (tool, pid_file) = hanging_tool(&dir);
            let ffmpeg = wrapper(&tool, Duration::from_millis(500));

            let started = Instant::now();
            let result = ffmpeg.probe(Path::new("clip.mp4"), &CancellationToken::new()).await;

            assert!(matches!(result, Err(GenerateError::Timeout("ffprobe"))));
            assert!(started.elapsed() < Duration::from_secs(10));
            let pid = read_pid(&pid_file).await;
            assert!(wait_until_gone(pid).await);
        }

        #[tokio::test]
        async fn cancelled_composition_reports_cancelled() {
            let dir = TempDir::new().unwrap();
            let (tool, pid_file) = hanging_tool(&dir);
            let ffmpeg = wrapper(&tool, Duration::from_secs(60));
            let cancel = CancellationToken::new();
            let out = dir.path().join("out.jpg");

            let trigger = async {
                let pid = read_pid(&pid_file).await;
                cancel.cancel();
                pid
            };
            let (result, pid) = tokio::join!(
                ffmpeg.compose_mosaic(Path::new("clip.mp4"), &out, 3, GridSpec::new(8, 4), 320, &cancel),
                trigger
            );

            assert!(matches!(result, Err(GenerateError::Cancelled)));
            assert!(wait_until_gone(pid).await);
            assert!(!out.exists());
        }
    }
}
