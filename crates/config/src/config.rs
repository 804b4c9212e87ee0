//! Core configuration structures and loading logic

use crate::profile::{default_profiles, find_profile, ProfileTable};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
    /// A value is outside its permitted range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Extensions accepted by a watch target when none are configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".m4v", ".webm",
];

/// A watched directory and the policy applied to files appearing in it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchTarget {
    /// Directory to watch
    pub path: PathBuf,
    /// Profile reference, by key or display name
    pub profile: String,
    /// Descend into subdirectories (default true)
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// Accepted extensions including the leading dot, matched case-insensitively
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Where outputs go; the source's own directory when unset
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Remove the source after a successful transcode
    #[serde(default)]
    pub delete_source: bool,
}

fn default_recursive() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

impl WatchTarget {
    /// Create a watch target with default policy.
    pub fn new(path: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            profile: profile.into(),
            recursive: default_recursive(),
            extensions: default_extensions(),
            output_dir: None,
            delete_source: false,
        }
    }

    /// Check whether `path` carries one of the accepted extensions.
    pub fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = format!(".{}", ext.to_lowercase());
                self.extensions
                    .iter()
                    .any(|allowed| allowed.to_lowercase() == ext_lower)
            })
            .unwrap_or(false)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Number of workers (default 2)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Simulate transcodes instead of invoking ffmpeg
    #[serde(default)]
    pub dry_run: bool,
    /// How long a worker waits on an empty queue before re-checking for shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after an unexpected worker-loop fault
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

fn default_max_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_error_backoff_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            dry_run: false,
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

/// File stability sampling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StabilityConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_samples")]
    pub max_samples: u32,
    #[serde(default = "default_required_stable_samples")]
    pub required_stable_samples: u32,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_samples() -> u32 {
    30
}

fn default_required_stable_samples() -> u32 {
    3
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_samples: default_max_samples(),
            required_stable_samples: default_required_stable_samples(),
        }
    }
}

/// Job state persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    /// Directory holding one JSON document per job record
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("recodex-state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

/// HTTP API listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding or building a client URL
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Hardware encoder family used when a profile asks for acceleration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareBackend {
    /// Software encoders only
    #[default]
    #[serde(rename = "none")]
    Software,
    Nvenc,
    Qsv,
    Vaapi,
}

/// External tool locations and hardware selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    #[serde(default)]
    pub hardware_backend: HardwareBackend,
    /// Render node for VAAPI
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: PathBuf,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_vaapi_device() -> PathBuf {
    PathBuf::from("/dev/dri/renderD128")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            hardware_backend: HardwareBackend::Software,
            vaapi_device: default_vaapi_device(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional file receiving a copy of all log output
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Profile table; the stock profiles apply when the section is absent
    #[serde(default = "default_profiles")]
    pub profiles: ProfileTable,
    /// Watched directories
    #[serde(default)]
    pub watch: Vec<WatchTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            stability: StabilityConfig::default(),
            state: StateConfig::default(),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            profiles: default_profiles(),
            watch: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RECODEX_MAX_WORKERS -> worker.max_workers
    /// - RECODEX_DRY_RUN -> worker.dry_run
    /// - RECODEX_STATE_DIR -> state.dir
    /// - RECODEX_SERVER_HOST -> server.host
    /// - RECODEX_SERVER_PORT -> server.port
    /// - RECODEX_LOG_LEVEL -> logging.level
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RECODEX_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<usize>() {
                self.worker.max_workers = workers;
            }
        }

        if let Ok(val) = env::var("RECODEX_DRY_RUN") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.worker.dry_run = true,
                "false" | "0" | "no" => self.worker.dry_run = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("RECODEX_STATE_DIR") {
            if !val.is_empty() {
                self.state.dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RECODEX_SERVER_HOST") {
            if !val.is_empty() {
                self.server.host = val;
            }
        }

        if let Ok(val) = env::var("RECODEX_SERVER_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("RECODEX_LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val.to_lowercase();
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with
    ///
    /// Unresolvable watch-target profiles are not an error here; see
    /// [`Config::unresolved_watch_targets`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_workers must be at least 1".to_string(),
            ));
        }
        if self.stability.max_samples == 0 {
            return Err(ConfigError::Invalid(
                "stability.max_samples must be at least 1".to_string(),
            ));
        }
        if self.stability.required_stable_samples == 0 {
            return Err(ConfigError::Invalid(
                "stability.required_stable_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Watch targets whose profile reference matches no configured profile
    pub fn unresolved_watch_targets(&self) -> Vec<&WatchTarget> {
        self.watch
            .iter()
            .filter(|target| find_profile(&self.profiles, &target.profile).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("RECODEX_MAX_WORKERS");
        env::remove_var("RECODEX_DRY_RUN");
        env::remove_var("RECODEX_STATE_DIR");
        env::remove_var("RECODEX_SERVER_HOST");
        env::remove_var("RECODEX_SERVER_PORT");
        env::remove_var("RECODEX_LOG_LEVEL");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_workers in 1usize..32,
            dry_run in proptest::bool::ANY,
            interval_ms in 1u64..5000,
            max_samples in 1u32..100,
            required in 1u32..10,
            port in 1u16..u16::MAX,
            recursive in proptest::bool::ANY,
            delete_source in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[worker]
max_workers = {}
dry_run = {}

[stability]
interval_ms = {}
max_samples = {}
required_stable_samples = {}

[server]
port = {}

[[watch]]
path = "/media/incoming"
profile = "balanced"
recursive = {}
delete_source = {}
"#,
                max_workers, dry_run, interval_ms, max_samples, required, port,
                recursive, delete_source
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.worker.max_workers, max_workers);
            prop_assert_eq!(config.worker.dry_run, dry_run);
            prop_assert_eq!(config.stability.interval_ms, interval_ms);
            prop_assert_eq!(config.stability.max_samples, max_samples);
            prop_assert_eq!(config.stability.required_stable_samples, required);
            prop_assert_eq!(config.server.port, port);
            prop_assert_eq!(config.watch.len(), 1);
            prop_assert_eq!(config.watch[0].recursive, recursive);
            prop_assert_eq!(config.watch[0].delete_source, delete_source);
            // Profiles section absent, so the stock set applies
            prop_assert_eq!(config.profiles.len(), 3);
        }

        #[test]
        fn prop_env_overrides_max_workers(
            initial in 1usize..16,
            override_workers in 1usize..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\nmax_workers = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RECODEX_MAX_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.max_workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_server_port(
            initial in 1u16..u16::MAX,
            override_port in 1u16..u16::MAX,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[server]\nport = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RECODEX_SERVER_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.server.port, override_port);
        }

        #[test]
        fn prop_env_overrides_dry_run(
            initial in proptest::bool::ANY,
            override_dry_run in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\ndry_run = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RECODEX_DRY_RUN", override_dry_run.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.dry_run, override_dry_run);
        }
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("RECODEX_MAX_WORKERS", "many");
        env::set_var("RECODEX_SERVER_PORT", "99999");
        env::set_var("RECODEX_DRY_RUN", "perhaps");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.worker.max_workers, 2);
        assert_eq!(config.server.port, 8000);
        assert!(!config.worker.dry_run);
    }

    #[test]
    fn test_env_overrides_strings() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("RECODEX_STATE_DIR", "/var/lib/recodex");
        env::set_var("RECODEX_SERVER_HOST", "0.0.0.0");
        env::set_var("RECODEX_LOG_LEVEL", "DEBUG");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.state.dir, PathBuf::from("/var/lib/recodex"));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.level, "debug");
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.worker.max_workers, 2);
        assert!(!config.worker.dry_run);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(config.worker.error_backoff_secs, 5);
        assert_eq!(config.stability.interval_ms, 1000);
        assert_eq!(config.stability.max_samples, 30);
        assert_eq!(config.stability.required_stable_samples, 3);
        assert_eq!(config.server.address(), "127.0.0.1:8000");
        assert_eq!(config.engine.hardware_backend, HardwareBackend::Software);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert!(config.profiles.contains_key("high_quality"));
        assert!(config.profiles.contains_key("balanced"));
        assert!(config.profiles.contains_key("small_file"));
        assert!(config.watch.is_empty());
    }

    // Explicit profiles replace the stock set
    #[test]
    fn test_explicit_profiles_replace_defaults() {
        let toml_str = r#"
[profiles.archive]
name = "Archive"
video_codec = "av1"
container = "mkv"
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles["archive"].video_codec, "av1");
    }

    #[test]
    fn test_watch_target_defaults() {
        let toml_str = r#"
[[watch]]
path = "/media/in"
profile = "Balanced"
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        let target = &config.watch[0];
        assert!(target.recursive);
        assert!(!target.delete_source);
        assert!(target.output_dir.is_none());
        assert_eq!(target.extensions.len(), DEFAULT_EXTENSIONS.len());
        assert!(config.unresolved_watch_targets().is_empty());
    }

    #[test]
    fn test_accepts_extension_case_insensitive() {
        let target = WatchTarget::new("/media", "balanced");
        assert!(target.accepts_extension(Path::new("/media/a.mp4")));
        assert!(target.accepts_extension(Path::new("/media/a.MKV")));
        assert!(target.accepts_extension(Path::new("/media/a.WebM")));
        assert!(!target.accepts_extension(Path::new("/media/a.srt")));
        assert!(!target.accepts_extension(Path::new("/media/noext")));
    }

    #[test]
    fn test_unresolved_watch_targets() {
        let mut config = Config::default();
        config.watch.push(WatchTarget::new("/a", "balanced"));
        config.watch.push(WatchTarget::new("/b", "missing"));

        let unresolved = config.unresolved_watch_targets();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].path, PathBuf::from("/b"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.worker.max_workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.stability.required_stable_samples = 0;
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_toml_output_parses_back() {
        let mut config = Config::default();
        config.watch.push(WatchTarget {
            output_dir: Some(PathBuf::from("/media/out")),
            ..WatchTarget::new("/media/in", "small_file")
        });
        config.logging.file = Some(PathBuf::from("/tmp/recodex.log"));

        let rendered = config.to_toml_string().unwrap();
        let parsed = Config::parse_toml(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
