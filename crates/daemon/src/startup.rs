//! Startup checks run before the daemon accepts work.
//!
//! Verifies that the ffmpeg and ffprobe binaries respond and, when a hardware
//! backend is configured, that ffmpeg was built with its encoders.
//! Skipped entirely in dry-run mode.

use crate::engine::select_video_encoder;
use recodex_config::{Config, HardwareBackend, Profile};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {detail}")]
    ToolUnavailable { tool: String, detail: String },

    #[error("ffmpeg has no {encoder} encoder for hardware backend {backend:?}")]
    MissingEncoder {
        backend: HardwareBackend,
        encoder: String,
    },
}

/// Extract the version token following `<tool> version` in `-version` output.
///
/// Handles n-prefixed builds: "ffmpeg version n7.1-..." -> "7.1-..."
pub fn parse_tool_version(output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool.to_lowercase());
    let line = output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let token = line
        .to_lowercase()
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    Some(token.trim_start_matches('n').to_string())
}

/// Run `<path> -version` and return the reported version.
pub fn check_tool(path: &Path, tool: &str) -> Result<String, StartupError> {
    let unavailable = |detail: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        detail,
    };

    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("failed to run {}: {}", path.display(), e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("{} -version failed", path.display())));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&stdout, tool).unwrap_or_else(|| "unknown".to_string()))
}

/// Whether `ffmpeg -encoders` output lists `encoder`.
pub fn encoder_listed(encoders_output: &str, encoder: &str) -> bool {
    // Lines look like " V....D h264_nvenc           NVIDIA NVENC H.264 encoder"
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

/// Encoders the configured backend needs, derived from the engine's mapping.
pub fn required_encoders(backend: HardwareBackend) -> Vec<String> {
    if backend == HardwareBackend::Software {
        return Vec::new();
    }
    ["h264", "h265"]
        .iter()
        .map(|codec| {
            let probe = Profile {
                video_codec: codec.to_string(),
                hardware_accel: true,
                ..Profile::named("probe")
            };
            select_video_encoder(&probe, backend).encoder
        })
        .collect()
}

fn check_hardware_backend(ffmpeg: &Path, backend: HardwareBackend) -> Result<(), StartupError> {
    let required = required_encoders(backend);
    if required.is_empty() {
        return Ok(());
    }

    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: "ffmpeg".to_string(),
            detail: format!("failed to list encoders: {}", e),
        })?;
    let listing = String::from_utf8_lossy(&output.stdout);

    for encoder in required {
        if !encoder_listed(&listing, &encoder) {
            return Err(StartupError::MissingEncoder { backend, encoder });
        }
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. ffmpeg responds
/// 2. ffprobe responds
/// 3. the hardware backend's encoders are present
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    if cfg.worker.dry_run {
        info!("dry run, skipping engine checks");
        return Ok(());
    }

    let ffmpeg = check_tool(&cfg.engine.ffmpeg_path, "ffmpeg")?;
    let ffprobe = check_tool(&cfg.engine.ffprobe_path, "ffprobe")?;
    check_hardware_backend(&cfg.engine.ffmpeg_path, cfg.engine.hardware_backend)?;

    info!(
        ffmpeg = %ffmpeg,
        ffprobe = %ffprobe,
        backend = ?cfg.engine.hardware_backend,
        "startup checks passed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_tool_version() {
        let out = "ffmpeg version 7.1 Copyright (c) 2000-2024 the FFmpeg developers\nbuilt with gcc";
        assert_eq!(parse_tool_version(out, "ffmpeg"), Some("7.1".to_string()));

        let nightly = "ffmpeg version n8.0-12-gdeadbeef Copyright";
        assert_eq!(
            parse_tool_version(nightly, "ffmpeg"),
            Some("8.0-12-gdeadbeef".to_string())
        );

        let probe = "ffprobe version 6.0 Copyright";
        assert_eq!(parse_tool_version(probe, "ffprobe"), Some("6.0".to_string()));
        assert_eq!(parse_tool_version(probe, "ffmpeg"), None);
        assert_eq!(parse_tool_version("", "ffmpeg"), None);
    }

    #[test]
    fn test_encoder_listed() {
        let listing = "Encoders:\n V..... = Video\n ------\n V....D libx264              libx264 H.264\n V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n A....D aac                  AAC";
        assert!(encoder_listed(listing, "h264_nvenc"));
        assert!(encoder_listed(listing, "libx264"));
        assert!(!encoder_listed(listing, "hevc_nvenc"));
        assert!(!encoder_listed(listing, "NVIDIA"));
    }

    #[test]
    fn test_required_encoders() {
        assert!(required_encoders(HardwareBackend::Software).is_empty());
        assert_eq!(
            required_encoders(HardwareBackend::Nvenc),
            vec!["h264_nvenc".to_string(), "hevc_nvenc".to_string()]
        );
        assert_eq!(
            required_encoders(HardwareBackend::Vaapi),
            vec!["h264_vaapi".to_string(), "hevc_vaapi".to_string()]
        );
    }

    #[test]
    fn test_missing_tool_reported() {
        let result = check_tool(&PathBuf::from("/nonexistent/ffmpeg-binary"), "ffmpeg");
        assert!(matches!(result, Err(StartupError::ToolUnavailable { .. })));
    }

    #[test]
    fn test_dry_run_skips_checks() {
        let mut cfg = Config::default();
        cfg.worker.dry_run = true;
        cfg.engine.ffmpeg_path = PathBuf::from("/nonexistent/ffmpeg-binary");
        assert!(run_startup_checks(&cfg).is_ok());
    }

    #[test]
    fn test_missing_ffmpeg_fails_checks() {
        let mut cfg = Config::default();
        cfg.engine.ffmpeg_path = PathBuf::from("/nonexistent/ffmpeg-binary");
        assert!(run_startup_checks(&cfg).is_err());
    }
}
