//! Transcoding profiles and profile lookup

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How subtitle streams are carried into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleMode {
    /// Copy subtitle streams unchanged.
    #[default]
    Copy,
    /// Drop all subtitle streams.
    None,
}

/// A named transcoding intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    /// Human-readable display name, also used as the output filename suffix.
    pub name: String,
    /// Target video codec (`h264`, `h265`/`hevc`, `av1`).
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Constant rate factor, or the backend's quality value under hardware
    /// encoding. Passed alongside `video_bitrate` when both are set.
    #[serde(default = "default_video_crf")]
    pub video_crf: Option<u32>,
    /// Target video bitrate such as `2M` or `2500k`.
    #[serde(default)]
    pub video_bitrate: Option<String>,
    /// Target audio codec, or `copy`.
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Audio bitrate such as `128k`.
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    /// Apply EBU R128 loudness normalisation.
    #[serde(default)]
    pub audio_normalize: bool,
    #[serde(default)]
    pub subtitles: SubtitleMode,
    /// Output container, which also determines the output extension.
    #[serde(default = "default_container")]
    pub container: String,
    /// Use the configured hardware backend when one is available.
    #[serde(default = "default_hardware_accel")]
    pub hardware_accel: bool,
    /// Encoder speed preset.
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_video_codec() -> String {
    "h264".to_string()
}

fn default_video_crf() -> Option<u32> {
    Some(23)
}

fn default_audio_codec() -> String {
    "copy".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_hardware_accel() -> bool {
    true
}

fn default_preset() -> String {
    "medium".to_string()
}

impl Profile {
    /// Create a profile with the given display name and default settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            video_codec: default_video_codec(),
            video_crf: default_video_crf(),
            video_bitrate: None,
            audio_codec: default_audio_codec(),
            audio_bitrate: None,
            audio_normalize: false,
            subtitles: SubtitleMode::Copy,
            container: default_container(),
            hardware_accel: default_hardware_accel(),
            preset: default_preset(),
        }
    }
}

/// Profile table keyed by stable profile key.
///
/// A `BTreeMap` keeps iteration in key order, which makes name lookups
/// deterministic when two profiles share a display name.
pub type ProfileTable = BTreeMap<String, Profile>;

/// Resolve a profile by key or by display name.
///
/// An exact key match wins. Otherwise the first profile in ascending key order
/// whose display name equals `reference` is returned. Matching is
/// case-sensitive.
pub fn find_profile<'a>(
    profiles: &'a ProfileTable,
    reference: &str,
) -> Option<(&'a str, &'a Profile)> {
    if let Some((key, profile)) = profiles.get_key_value(reference) {
        return Some((key.as_str(), profile));
    }

    profiles
        .iter()
        .find(|(_, profile)| profile.name == reference)
        .map(|(key, profile)| (key.as_str(), profile))
}

/// The stock profile set shipped with a fresh configuration.
pub fn default_profiles() -> ProfileTable {
    let mut profiles = ProfileTable::new();

    profiles.insert(
        "high_quality".to_string(),
        Profile {
            video_codec: "h265".to_string(),
            video_crf: Some(20),
            audio_codec: "copy".to_string(),
            container: "mkv".to_string(),
            preset: "slow".to_string(),
            ..Profile::named("High Quality")
        },
    );

    profiles.insert(
        "balanced".to_string(),
        Profile {
            video_codec: "h264".to_string(),
            video_crf: Some(23),
            audio_codec: "aac".to_string(),
            audio_bitrate: Some("128k".to_string()),
            container: "mp4".to_string(),
            preset: "medium".to_string(),
            ..Profile::named("Balanced")
        },
    );

    profiles.insert(
        "small_file".to_string(),
        Profile {
            video_codec: "h265".to_string(),
            video_crf: Some(28),
            audio_codec: "aac".to_string(),
            audio_bitrate: Some("96k".to_string()),
            container: "mp4".to_string(),
            preset: "slower".to_string(),
            ..Profile::named("Small File")
        },
    );

    profiles
}
