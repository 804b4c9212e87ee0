//! "Does this file need processing" decision functions.

use crate::probe::{parse_bitrate, probe_file, ProbeError, ProbeResult};
use async_trait::async_trait;
use recodex_config::Profile;
use std::path::{Path, PathBuf};

/// Decide whether `source` should be transcoded with `profile`.
///
/// Errors are reported to the caller, which treats them as "no".
#[async_trait]
pub trait NeedsProcessing: Send + Sync {
    async fn needs_processing(&self, source: &Path, profile: &Profile) -> Result<bool, ProbeError>;
}

/// Accepts every file.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysProcess;

#[async_trait]
impl NeedsProcessing for AlwaysProcess {
    async fn needs_processing(&self, _source: &Path, _profile: &Profile) -> Result<bool, ProbeError> {
        Ok(true)
    }
}

/// Probes the file with ffprobe and applies [`should_transcode`].
#[derive(Debug, Clone)]
pub struct FfprobeDecision {
    ffprobe: PathBuf,
}

impl FfprobeDecision {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

#[async_trait]
impl NeedsProcessing for FfprobeDecision {
    async fn needs_processing(&self, source: &Path, profile: &Profile) -> Result<bool, ProbeError> {
        let probe = probe_file(&self.ffprobe, source).await?;
        Ok(should_transcode(&probe, profile))
    }
}

/// Bitrate tolerance above the profile target before a re-encode is worth it.
const BITRATE_TOLERANCE: f64 = 1.2;

/// Fold codec aliases so ffprobe names compare with profile names.
fn canonical_codec(codec: &str) -> String {
    match codec.to_lowercase().as_str() {
        "h265" | "hevc" => "hevc".to_string(),
        "h264" | "avc" => "h264".to_string(),
        other => other.to_string(),
    }
}

/// Transcode when the source uses:
/// - a video codec outside {target, h264, hevc, av1}
/// - an older codec than the target (h264 -> hevc/av1, h264/hevc -> av1)
/// - a bitrate more than 20% above the profile's target bitrate
/// - a different audio codec than a non-`copy` profile audio codec
pub fn should_transcode(probe: &ProbeResult, profile: &Profile) -> bool {
    let target = canonical_codec(&profile.video_codec);

    if let Some(source_codec) = probe.video_codec().map(canonical_codec) {
        let known = [target.as_str(), "h264", "hevc", "av1"];
        if !known.contains(&source_codec.as_str()) {
            return true;
        }

        if source_codec != target {
            let upgrade_from_h264 =
                source_codec == "h264" && (target == "hevc" || target == "av1");
            let upgrade_to_av1 = target == "av1" && (source_codec == "h264" || source_codec == "hevc");
            if upgrade_from_h264 || upgrade_to_av1 {
                return true;
            }
        }
    }

    if let (Some(target_bps), Some(actual_bps)) = (
        profile.video_bitrate.as_deref().and_then(parse_bitrate),
        probe.format.bit_rate_bps,
    ) {
        if actual_bps as f64 > target_bps as f64 * BITRATE_TOLERANCE {
            return true;
        }
    }

    if profile.audio_codec != "copy" {
        if let Some(audio) = probe.audio_codec() {
            if !audio.eq_ignore_ascii_case(&profile.audio_codec) {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{AudioStream, FormatInfo, VideoStream};

    fn probe(video: Option<&str>, audio: Option<&str>, bit_rate: Option<u64>) -> ProbeResult {
        ProbeResult {
            video_streams: video
                .into_iter()
                .map(|codec| VideoStream {
                    codec_name: codec.to_string(),
                    width: 1920,
                    height: 1080,
                })
                .collect(),
            audio_streams: audio
                .into_iter()
                .map(|codec| AudioStream {
                    codec_name: codec.to_string(),
                    channels: 2,
                })
                .collect(),
            format: FormatInfo {
                duration_secs: Some(60.0),
                bit_rate_bps: bit_rate,
                size_bytes: 1_000_000,
            },
        }
    }

    fn profile(video: &str, audio: &str) -> Profile {
        Profile {
            video_codec: video.to_string(),
            audio_codec: audio.to_string(),
            ..Profile::named("Test")
        }
    }

    #[test]
    fn test_unusual_codec_is_transcoded() {
        assert!(should_transcode(&probe(Some("mpeg4"), None, None), &profile("h264", "copy")));
        assert!(should_transcode(&probe(Some("vp9"), None, None), &profile("h265", "copy")));
    }

    #[test]
    fn test_upgrades() {
        assert!(should_transcode(&probe(Some("h264"), None, None), &profile("h265", "copy")));
        assert!(should_transcode(&probe(Some("h264"), None, None), &profile("av1", "copy")));
        assert!(should_transcode(&probe(Some("hevc"), None, None), &profile("av1", "copy")));
    }

    #[test]
    fn test_no_downgrade() {
        assert!(!should_transcode(&probe(Some("hevc"), None, None), &profile("h264", "copy")));
        assert!(!should_transcode(&probe(Some("av1"), None, None), &profile("h265", "copy")));
    }

    #[test]
    fn test_same_codec_alias_not_transcoded() {
        // ffprobe reports "hevc" for an h265 target
        assert!(!should_transcode(&probe(Some("hevc"), None, None), &profile("h265", "copy")));
        assert!(!should_transcode(&probe(Some("h264"), None, None), &profile("h264", "copy")));
    }

    #[test]
    fn test_bitrate_tolerance() {
        let mut p = profile("h264", "copy");
        p.video_bitrate = Some("2M".to_string());

        assert!(!should_transcode(&probe(Some("h264"), None, Some(2_400_000)), &p));
        assert!(should_transcode(&probe(Some("h264"), None, Some(2_400_001)), &p));
        // Unknown source bitrate never triggers
        assert!(!should_transcode(&probe(Some("h264"), None, None), &p));
    }

    #[test]
    fn test_audio_mismatch() {
        assert!(should_transcode(&probe(Some("h264"), Some("ac3"), None), &profile("h264", "aac")));
        assert!(!should_transcode(&probe(Some("h264"), Some("AAC"), None), &profile("h264", "aac")));
        assert!(!should_transcode(&probe(Some("h264"), Some("ac3"), None), &profile("h264", "copy")));
    }

    #[test]
    fn test_audio_only_file() {
        assert!(!should_transcode(&probe(None, Some("aac"), None), &profile("h264", "aac")));
    }

    #[tokio::test]
    async fn test_always_process() {
        let decision = AlwaysProcess;
        assert!(decision
            .needs_processing(Path::new("/in/a.mp4"), &profile("h264", "copy"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ffprobe_decision_reports_probe_failure() {
        let decision = FfprobeDecision::new("/nonexistent/ffprobe-binary");
        let result = decision
            .needs_processing(Path::new("/in/a.mp4"), &profile("h264", "copy"))
            .await;
        assert!(result.is_err());
    }
}
