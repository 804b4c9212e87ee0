//! Transcoding engines.
//!
//! The worker pool only sees the [`TranscodeEngine`] trait. [`FfmpegEngine`]
//! drives an ffmpeg subprocess; [`DryRunEngine`] simulates a transcode without
//! touching any output.

use crate::destination::{ensure_parent_dir, temporary_output};
use crate::probe::probe_file;
use async_trait::async_trait;
use recodex_config::{EngineConfig, HardwareBackend, Profile, SubtitleMode};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lines of ffmpeg stderr kept for failure messages.
const STDERR_TAIL_LINES: usize = 8;

/// Error type for transcoding operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// ffmpeg process exited with non-zero status
    #[error("ffmpeg failed with exit code {code}: {detail}")]
    FfmpegFailed { code: i32, detail: String },

    /// ffmpeg process was terminated by signal
    #[error("ffmpeg process was terminated by signal")]
    FfmpegTerminated,

    /// IO error reading the source or writing the output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sizes and flags reported by a successful transcode.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeOutcome {
    pub original_size: u64,
    /// Size of the written output; `None` when nothing was written.
    pub final_size: Option<u64>,
    pub hardware_accel_used: bool,
}

/// Progress reporter handed to an engine.
///
/// Values are clamped to 0..=100 and never move backwards.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Arc<watch::Sender<f32>>,
}

impl ProgressSink {
    pub fn new() -> (Self, watch::Receiver<f32>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, percent: f32) {
        if percent.is_nan() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> f32 {
        *self.tx.borrow()
    }
}

/// An external transcoding engine.
///
/// Must never leave a partial file at `destination` on failure.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn transcode(
        &self,
        source: &Path,
        destination: &Path,
        profile: &Profile,
        progress: &ProgressSink,
    ) -> Result<TranscodeOutcome, EngineError>;
}

/// Simulated engine used for dry runs.
#[derive(Debug, Clone)]
pub struct DryRunEngine {
    delay: Duration,
}

impl DryRunEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for DryRunEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TranscodeEngine for DryRunEngine {
    async fn transcode(
        &self,
        source: &Path,
        destination: &Path,
        _profile: &Profile,
        progress: &ProgressSink,
    ) -> Result<TranscodeOutcome, EngineError> {
        let original_size = tokio::fs::metadata(source).await?.len();
        info!(
            source = %source.display(),
            destination = %destination.display(),
            "dry run, not transcoding"
        );
        tokio::time::sleep(self.delay).await;
        progress.report(100.0);
        Ok(TranscodeOutcome {
            original_size,
            final_size: None,
            hardware_accel_used: false,
        })
    }
}

/// Video encoder chosen for a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSelection {
    pub encoder: String,
    pub hardware: Option<HardwareBackend>,
}

/// Map a profile's codec to an ffmpeg encoder, preferring `backend` when the
/// profile allows hardware acceleration and the backend supports the codec.
pub fn select_video_encoder(profile: &Profile, backend: HardwareBackend) -> EncoderSelection {
    let codec = profile.video_codec.to_lowercase();
    let family = match codec.as_str() {
        "h264" | "avc" => Some("h264"),
        "h265" | "hevc" => Some("hevc"),
        _ => None,
    };

    if profile.hardware_accel {
        let suffix = match backend {
            HardwareBackend::Nvenc => Some("nvenc"),
            HardwareBackend::Qsv => Some("qsv"),
            HardwareBackend::Vaapi => Some("vaapi"),
            HardwareBackend::Software => None,
        };
        if let (Some(family), Some(suffix)) = (family, suffix) {
            return EncoderSelection {
                encoder: format!("{}_{}", family, suffix),
                hardware: Some(backend),
            };
        }
    }

    let encoder = match codec.as_str() {
        "h265" | "hevc" => "libx265",
        "av1" => "libaom-av1",
        _ => "libx264",
    };
    EncoderSelection {
        encoder: encoder.to_string(),
        hardware: None,
    }
}

/// Translate an x264-style preset name to an NVENC preset.
fn nvenc_preset(preset: &str) -> &'static str {
    match preset {
        "ultrafast" => "p1",
        "superfast" => "p2",
        "veryfast" => "p3",
        "faster" => "p4",
        "fast" => "p5",
        "medium" => "p6",
        "slow" | "slower" | "veryslow" => "p7",
        _ => "p6",
    }
}

/// Build an ffmpeg command that transcodes `input` into `output`.
///
/// Returns the command and whether a hardware encoder was selected.
pub fn build_ffmpeg_command(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    profile: &Profile,
    backend: HardwareBackend,
    vaapi_device: &Path,
) -> (Command, bool) {
    let selection = select_video_encoder(profile, backend);
    let mut cmd = Command::new(ffmpeg);

    cmd.arg("-hide_banner").arg("-y");

    // VAAPI device must be initialised before the input is opened
    if selection.hardware == Some(HardwareBackend::Vaapi) {
        cmd.arg("-vaapi_device").arg(vaapi_device);
    }

    cmd.arg("-i").arg(input);

    cmd.arg("-c:v").arg(&selection.encoder);

    if selection.hardware == Some(HardwareBackend::Vaapi) {
        cmd.arg("-vf").arg("format=nv12,hwupload");
    }

    if let Some(crf) = profile.video_crf {
        let flag = match selection.hardware {
            Some(HardwareBackend::Nvenc) => "-cq",
            Some(HardwareBackend::Vaapi) => "-qp",
            Some(HardwareBackend::Qsv) => "-global_quality",
            _ => "-crf",
        };
        cmd.arg(flag).arg(crf.to_string());
    }

    match &profile.video_bitrate {
        Some(bitrate) => {
            cmd.arg("-b:v").arg(bitrate);
        }
        // libaom only honours crf in constant-quality mode
        None if selection.encoder == "libaom-av1" && profile.video_crf.is_some() => {
            cmd.arg("-b:v").arg("0");
        }
        None => {}
    }

    match selection.hardware {
        None if selection.encoder != "libaom-av1" => {
            cmd.arg("-preset").arg(&profile.preset);
        }
        Some(HardwareBackend::Nvenc) => {
            cmd.arg("-preset").arg(nvenc_preset(&profile.preset));
        }
        _ => {}
    }

    if profile.audio_codec == "copy" {
        cmd.arg("-c:a").arg("copy");
    } else {
        cmd.arg("-c:a").arg(&profile.audio_codec);
        if let Some(bitrate) = &profile.audio_bitrate {
            cmd.arg("-b:a").arg(bitrate);
        }
        if profile.audio_normalize {
            cmd.arg("-af").arg("loudnorm");
        }
    }

    match profile.subtitles {
        SubtitleMode::Copy => {
            cmd.arg("-c:s").arg("copy");
        }
        SubtitleMode::None => {
            cmd.arg("-sn");
        }
    }

    cmd.arg("-progress").arg("pipe:2");
    cmd.arg(output);

    (cmd, selection.hardware.is_some())
}

/// Extract the media timestamp, in seconds, from an ffmpeg progress or stats line.
///
/// Understands both `out_time=00:01:02.500000` and `... time=00:01:02.50 bitrate=...`.
pub fn parse_progress_time(line: &str) -> Option<f64> {
    let start = line.find("time=")? + "time=".len();
    let value = line[start..].split_whitespace().next()?;

    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// `key=value` lines emitted by `-progress`, as opposed to diagnostics.
fn is_progress_line(line: &str) -> bool {
    line.split_once('=')
        .map(|(key, _)| {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .unwrap_or(false)
}

/// Engine that shells out to ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    backend: HardwareBackend,
    vaapi_device: PathBuf,
}

impl FfmpegEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            backend: config.hardware_backend,
            vaapi_device: config.vaapi_device.clone(),
        }
    }

    async fn run(
        &self,
        source: &Path,
        temp: &Path,
        profile: &Profile,
        progress: &ProgressSink,
    ) -> Result<bool, EngineError> {
        let duration = match probe_file(&self.ffprobe, source).await {
            Ok(probe) => probe.format.duration_secs.filter(|d| *d > 0.0),
            Err(e) => {
                warn!(source = %source.display(), error = %e, "no duration, progress will not be tracked");
                None
            }
        };

        let (cmd, hardware) =
            build_ffmpeg_command(&self.ffmpeg, source, temp, profile, self.backend, &self.vaapi_device);
        debug!(command = ?cmd, "starting ffmpeg");

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            // ffmpeg echoes file names and tags as raw bytes
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if let (Some(total), Some(current)) = (duration, parse_progress_time(&line)) {
                    progress.report((current / total * 100.0) as f32);
                }
                if !is_progress_line(&line) {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            return Ok(hardware);
        }

        match status.code() {
            Some(code) => Err(EngineError::FfmpegFailed {
                code,
                detail: tail.into_iter().collect::<Vec<_>>().join("; "),
            }),
            None => Err(EngineError::FfmpegTerminated),
        }
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn transcode(
        &self,
        source: &Path,
        destination: &Path,
        profile: &Profile,
        progress: &ProgressSink,
    ) -> Result<TranscodeOutcome, EngineError> {
        let original_size = tokio::fs::metadata(source).await?.len();
        ensure_parent_dir(destination)?;
        let temp = temporary_output(destination);

        info!(
            source = %source.display(),
            destination = %destination.display(),
            profile = %profile.name,
            "transcode starting"
        );

        let result = match self.run(source, &temp, profile, progress).await {
            Ok(hardware) => tokio::fs::rename(&temp, destination)
                .await
                .map(|_| hardware)
                .map_err(EngineError::from),
            Err(e) => Err(e),
        };

        let hardware_accel_used = match result {
            Ok(hardware) => hardware,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(temp = %temp.display(), error = %cleanup, "failed to remove partial output");
                    }
                }
                return Err(e);
            }
        };

        let final_size = tokio::fs::metadata(destination).await?.len();
        progress.report(100.0);

        Ok(TranscodeOutcome {
            original_size,
            final_size: Some(final_size),
            hardware_accel_used,
        })
    }
}
