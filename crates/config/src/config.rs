//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
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

/// External programs invoked by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Encoder and concat/remux program (default "ffmpeg")
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// Frame-count probe program (default "ffprobe")
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// Frame generation program (default "vspipe")
    #[serde(default = "default_vspipe")]
    pub vspipe: String,
    /// Filter script handed to the frame generator
    #[serde(default = "default_script")]
    pub script: PathBuf,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_vspipe() -> String {
    "vspipe".to_string()
}

fn default_script() -> PathBuf {
    PathBuf::from("/upscale/script.py")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            vspipe: default_vspipe(),
            script: default_script(),
        }
    }
}

/// Encoder argument groups
///
/// The encoder command line is assembled as
/// `<input_args> -i - <encode_args> -progress pipe:1 -stats_period N -y <out>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Flags placed before the `-i -` input (default: `-hide_banner -loglevel info`)
    #[serde(default = "default_input_args")]
    pub input_args: Vec<String>,
    /// Codec and quality flags placed after the input (default: 10-bit HEVC NVENC, VBR CQ 16)
    #[serde(default = "default_encode_args")]
    pub encode_args: Vec<String>,
    /// Interval between progress blocks written by the encoder (default 10)
    #[serde(default = "default_stats_period_secs")]
    pub stats_period_secs: u64,
}

fn default_input_args() -> Vec<String> {
    to_args(&["-hide_banner", "-loglevel", "info"])
}

fn default_encode_args() -> Vec<String> {
    to_args(&[
        "-c:v",
        "hevc_nvenc",
        "-profile:v",
        "main10",
        "-preset:v",
        "slow",
        "-rc:v",
        "vbr",
        "-cq:v",
        "16",
        "-temporal_aq",
        "1",
        "-spatial_aq",
        "1",
        "-g",
        "24",
        "-strict_gop",
        "1",
    ])
}

fn default_stats_period_secs() -> u64 {
    10
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_args: default_input_args(),
            encode_args: default_encode_args(),
            stats_period_secs: default_stats_period_secs(),
        }
    }
}

/// Chunked pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Frames per chunk (default 7200, about five minutes at 24fps)
    #[serde(default = "default_frames_per_chunk")]
    pub frames_per_chunk: u64,
    /// Heartbeat interval while a chunk is running (default 10)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Keep the work directory (logs, frame count) after a successful run (default false)
    #[serde(default)]
    pub keep_logs: bool,
}

fn default_frames_per_chunk() -> u64 {
    7200
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frames_per_chunk: default_frames_per_chunk(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            keep_logs: false,
        }
    }
}

/// Directory scanner settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerConfig {
    /// Marker file that activates scanning for a subtree (default ".upscale")
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    /// Container extension considered by the scanner, without the dot (default "mkv")
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Filename tag of upscale sources (default "1080p")
    #[serde(default = "default_hd_tag")]
    pub hd_tag: String,
    /// Filename tags of already upscaled files; the first one names new outputs
    #[serde(default = "default_uhd_tags")]
    pub uhd_tags: Vec<String>,
    /// Sources modified within this window are queued with critical priority (default 6)
    #[serde(default = "default_recent_window_hours")]
    pub recent_window_hours: u64,
}

fn default_marker_file() -> String {
    ".upscale".to_string()
}

fn default_extension() -> String {
    "mkv".to_string()
}

fn default_hd_tag() -> String {
    "1080p".to_string()
}

fn default_uhd_tags() -> Vec<String> {
    to_args(&["2160p", "-4k"])
}

fn default_recent_window_hours() -> u64 {
    6
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            marker_file: default_marker_file(),
            extension: default_extension(),
            hd_tag: default_hd_tag(),
            uhd_tags: default_uhd_tags(),
            recent_window_hours: default_recent_window_hours(),
        }
    }
}

/// Task queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Directory holding one JSON record per task
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Retries after the first failed attempt (default 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Execution timeout per attempt (default 3 hours)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How long finished task records are kept (default 30 days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Idle delay between polls of an empty queue (default 5)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/video-upscaler/queue")
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    3 * 60 * 60
}

fn default_retention_days() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retention_days: default_retention_days(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Root of the per-task work directories
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Tasks processed at the same time (default 1)
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// `host:port` for the HTTP metrics exporter; disabled when unset
    #[serde(default)]
    pub metrics_exporter: Option<String>,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/var/cache/upscalers")
}

fn default_concurrency() -> u32 {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            concurrency: default_concurrency(),
            metrics_exporter: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FFMPEG_INPUT_ARGS -> encoder.input_args (whitespace separated)
    /// - FFMPEG_TRANSCODE_ARGS -> encoder.encode_args (whitespace separated)
    /// - TEMP_DIR -> worker.temp_dir
    /// - UPSCALER_STATE_DIR -> queue.state_dir
    /// - UPSCALER_FRAMES_PER_CHUNK -> pipeline.frames_per_chunk
    /// - UPSCALER_CONCURRENCY -> worker.concurrency
    /// - METRICS_EXPORTER -> worker.metrics_exporter
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FFMPEG_INPUT_ARGS") {
            if let Some(args) = split_args(&val) {
                self.encoder.input_args = args;
            }
        }

        if let Ok(val) = env::var("FFMPEG_TRANSCODE_ARGS") {
            if let Some(args) = split_args(&val) {
                self.encoder.encode_args = args;
            }
        }

        if let Ok(val) = env::var("TEMP_DIR") {
            if !val.trim().is_empty() {
                self.worker.temp_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("UPSCALER_STATE_DIR") {
            if !val.trim().is_empty() {
                self.queue.state_dir = PathBuf::from(val);
            }
        }

        // Zero-sized chunks would never advance, keep the existing value
        if let Ok(val) = env::var("UPSCALER_FRAMES_PER_CHUNK") {
            if let Ok(frames) = val.parse::<u64>() {
                if frames > 0 {
                    self.pipeline.frames_per_chunk = frames;
                }
            }
        }

        if let Ok(val) = env::var("UPSCALER_CONCURRENCY") {
            if let Ok(concurrency) = val.parse::<u32>() {
                if concurrency > 0 {
                    self.worker.concurrency = concurrency;
                }
            }
        }

        if let Ok(val) = env::var("METRICS_EXPORTER") {
            let addr = val.trim();
            if !addr.is_empty() {
                self.worker.metrics_exporter = Some(addr.to_string());
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }
}

/// Split an argument string on whitespace; blank strings are rejected
pub fn split_args(value: &str) -> Option<Vec<String>> {
    let args: Vec<String> = value.split_whitespace().map(String::from).collect();
    if args.is_empty() {
        None
    } else {
        Some(args)
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
        env::remove_var("FFMPEG_INPUT_ARGS");
        env::remove_var("FFMPEG_TRANSCODE_ARGS");
        env::remove_var("TEMP_DIR");
        env::remove_var("UPSCALER_STATE_DIR");
        env::remove_var("UPSCALER_FRAMES_PER_CHUNK");
        env::remove_var("UPSCALER_CONCURRENCY");
        env::remove_var("METRICS_EXPORTER");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            frames in 1u64..100_000,
            heartbeat in 1u64..120,
            keep_logs in proptest::bool::ANY,
            max_retries in 0u32..10,
            timeout in 1u64..100_000,
            concurrency in 1u32..8,
            hd_tag in "[a-z0-9]{2,8}",
        ) {
            let toml_str = format!(
                r#"
[tools]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"

[encoder]
input_args = ["-hide_banner"]
encode_args = ["-c:v", "libx265"]

[pipeline]
frames_per_chunk = {}
heartbeat_interval_secs = {}
keep_logs = {}

[scanner]
hd_tag = "{}"

[queue]
max_retries = {}
timeout_secs = {}

[worker]
concurrency = {}
"#,
                frames, heartbeat, keep_logs, hd_tag, max_retries, timeout, concurrency
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.tools.ffmpeg.as_str(), "/opt/ffmpeg/bin/ffmpeg");
            prop_assert_eq!(config.tools.ffprobe.as_str(), "ffprobe");
            prop_assert_eq!(config.encoder.input_args, vec!["-hide_banner".to_string()]);
            prop_assert_eq!(config.encoder.encode_args.len(), 2);
            prop_assert_eq!(config.pipeline.frames_per_chunk, frames);
            prop_assert_eq!(config.pipeline.heartbeat_interval_secs, heartbeat);
            prop_assert_eq!(config.pipeline.keep_logs, keep_logs);
            prop_assert_eq!(config.scanner.hd_tag, hd_tag);
            prop_assert_eq!(config.queue.max_retries, max_retries);
            prop_assert_eq!(config.queue.timeout_secs, timeout);
            prop_assert_eq!(config.worker.concurrency, concurrency);
        }

        #[test]
        fn prop_env_overrides_frames_per_chunk(
            initial in 1u64..10_000,
            override_frames in 0u64..20_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[pipeline]\nframes_per_chunk = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("UPSCALER_FRAMES_PER_CHUNK", override_frames.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            let expected = if override_frames == 0 { initial } else { override_frames };
            prop_assert_eq!(config.pipeline.frames_per_chunk, expected);
        }

        #[test]
        fn prop_env_overrides_encode_args(
            args in proptest::collection::vec("-?[a-z0-9:]{1,8}", 1..8),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("FFMPEG_TRANSCODE_ARGS", args.join("  "));
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.encode_args, args);
            prop_assert_eq!(config.encoder.input_args, default_input_args());
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.tools.vspipe, "vspipe");
        assert_eq!(config.tools.script, PathBuf::from("/upscale/script.py"));
        assert_eq!(config.encoder.input_args, vec!["-hide_banner", "-loglevel", "info"]);
        assert!(config.encoder.encode_args.contains(&"hevc_nvenc".to_string()));
        assert_eq!(config.encoder.stats_period_secs, 10);
        assert_eq!(config.pipeline.frames_per_chunk, 7200);
        assert_eq!(config.pipeline.heartbeat_interval_secs, 10);
        assert!(!config.pipeline.keep_logs);
        assert_eq!(config.scanner.marker_file, ".upscale");
        assert_eq!(config.scanner.uhd_tags, vec!["2160p", "-4k"]);
        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.queue.timeout_secs, 10800);
        assert_eq!(config.queue.retention_days, 30);
        assert_eq!(config.worker.concurrency, 1);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[worker]
temp_dir = "/scratch/upscale"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.worker.temp_dir, PathBuf::from("/scratch/upscale"));
        assert_eq!(config.worker.concurrency, 1); // default
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.encoder, EncoderConfig::default());
    }

    #[test]
    fn test_blank_env_args_keep_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FFMPEG_INPUT_ARGS", "   ");
        env::set_var("UPSCALER_CONCURRENCY", "lots");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.input_args, default_input_args());
        assert_eq!(config.worker.concurrency, 1);
    }

    #[test]
    fn test_metrics_exporter_from_file_and_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[worker]\nmetrics_exporter = \"127.0.0.1:9090\"\n")
            .expect("TOML should parse");
        assert_eq!(config.worker.metrics_exporter.as_deref(), Some("127.0.0.1:9090"));

        env::set_var("METRICS_EXPORTER", " 0.0.0.0:9100 ");
        config.apply_env_overrides();
        env::set_var("METRICS_EXPORTER", "");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.worker.metrics_exporter.as_deref(), Some("0.0.0.0:9100"));
        assert_eq!(Config::default().worker.metrics_exporter, None);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/video-upscaler/config.toml")
            .expect("Missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = Config::parse_toml("[pipeline\nframes_per_chunk = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
