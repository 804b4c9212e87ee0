//! Media inspection through ffprobe.
//!
//! Collects the stream and container facts needed to decide whether a file
//! needs transcoding and to turn ffmpeg timestamps into progress.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "av1").
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
}

/// Information about an audio stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    /// Codec name (e.g., "aac", "ac3").
    pub codec_name: String,
    pub channels: u32,
}

/// Container-level information from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    /// Duration in seconds, if the container reports one.
    pub duration_secs: Option<f64>,
    /// Overall bitrate in bits per second.
    pub bit_rate_bps: Option<u64>,
    pub size_bytes: u64,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    pub format: FormatInfo,
}

impl ProbeResult {
    /// Codec of the first video stream.
    pub fn video_codec(&self) -> Option<&str> {
        self.video_streams.first().map(|s| s.codec_name.as_str())
    }

    /// Codec of the first audio stream.
    pub fn audio_codec(&self) -> Option<&str> {
        self.audio_streams.first().map(|s| s.codec_name.as_str())
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probe `path` with the ffprobe binary at `ffprobe`.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
pub async fn probe_file(ffprobe: &Path, path: &Path) -> Result<ProbeResult, ProbeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for stream in ffprobe.streams.unwrap_or_default() {
        let codec_name = stream.codec_name.clone().unwrap_or_default();
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => video_streams.push(VideoStream {
                codec_name,
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
            }),
            "audio" => audio_streams.push(AudioStream {
                codec_name,
                channels: stream.channels.unwrap_or(0),
            }),
            _ => {}
        }
    }

    Ok(ProbeResult {
        video_streams,
        audio_streams,
        format: FormatInfo {
            duration_secs: format.duration.as_ref().and_then(|d| d.parse::<f64>().ok()),
            bit_rate_bps: format.bit_rate.as_ref().and_then(|b| b.parse::<u64>().ok()),
            size_bytes: format
                .size
                .as_ref()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
        },
    })
}

/// Parse a bitrate string such as `2M`, `2500k` or `800000` into bits/second.
pub fn parse_bitrate(value: &str) -> Option<u64> {
    let lower = value.trim().to_lowercase();
    let (number, scale) = if let Some(n) = lower.strip_suffix('k') {
        (n, 1_000.0)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1_000_000.0)
    } else {
        (lower.as_str(), 1.0)
    };
    let parsed = number.parse::<f64>().ok()?;
    if parsed < 0.0 {
        return None;
    }
    Some((parsed * scale) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
            {"codec_type": "audio", "codec_name": "ac3", "channels": 6},
            {"codec_type": "subtitle", "codec_name": "subrip"}
        ],
        "format": {"duration": "5400.25", "size": "4000000000", "bit_rate": "5925000"}
    }"#;

    #[test]
    fn test_parse_full_output() {
        let probe = parse_ffprobe_output(SAMPLE).unwrap();
        assert_eq!(probe.video_codec(), Some("h264"));
        assert_eq!(probe.audio_codec(), Some("ac3"));
        assert_eq!(probe.video_streams[0].width, 1920);
        assert_eq!(probe.audio_streams[0].channels, 6);
        assert_eq!(probe.format.duration_secs, Some(5400.25));
        assert_eq!(probe.format.bit_rate_bps, Some(5_925_000));
        assert_eq!(probe.format.size_bytes, 4_000_000_000);
    }

    #[test]
    fn test_parse_missing_optional_fields() {
        let probe = parse_ffprobe_output(r#"{"format": {}}"#).unwrap();
        assert!(probe.video_codec().is_none());
        assert!(probe.audio_codec().is_none());
        assert!(probe.format.duration_secs.is_none());
        assert!(probe.format.bit_rate_bps.is_none());
    }

    #[test]
    fn test_parse_missing_format_is_error() {
        let result = parse_ffprobe_output(r#"{"streams": []}"#);
        assert!(matches!(result, Err(ProbeError::ParseError(_))));
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("2M"), Some(2_000_000));
        assert_eq!(parse_bitrate("2500k"), Some(2_500_000));
        assert_eq!(parse_bitrate("1.5m"), Some(1_500_000));
        assert_eq!(parse_bitrate("800000"), Some(800_000));
        assert_eq!(parse_bitrate("fast"), None);
        assert_eq!(parse_bitrate("-3k"), None);
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_io_error() {
        let result = probe_file(
            Path::new("/nonexistent/ffprobe-binary"),
            Path::new("/tmp/whatever.mp4"),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }
}
