//! Beat configuration types
//!
//! These are plain serde structs. Loading them from files and the environment
//! is the binary's job.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name used in the readiness line, event type and default file names
pub const BEAT_NAME: &str = "hwbeat";

/// Top-level beat configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BeatConfig {
    /// Host name attached to every event
    #[serde(default = "default_name")]
    pub name: String,

    /// Default collection period in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Upper bound on a single poll in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Root of the proc filesystem read by the built-in collectors
    #[serde(default = "default_proc_path")]
    pub proc_path: PathBuf,

    #[serde(default = "default_collectors")]
    pub collectors: Vec<CollectorConfig>,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_period_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    5000
}

fn default_proc_path() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_collectors() -> Vec<CollectorConfig> {
    [CollectorKind::Cpu, CollectorKind::Memory, CollectorKind::Load]
        .into_iter()
        .map(|kind| CollectorConfig {
            kind,
            fields: Vec::new(),
            period_ms: None,
            per_instance: false,
        })
        .collect()
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            period_ms: default_period_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            proc_path: default_proc_path(),
            collectors: default_collectors(),
            processing: ProcessingConfig::default(),
            pipeline: PipelineConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl BeatConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Effective period for one collector
    pub fn collector_period(&self, collector: &CollectorConfig) -> Duration {
        Duration::from_millis(collector.period_ms.unwrap_or(self.period_ms))
    }

    /// Reject settings that would make the agent spin or never ship
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_ms == 0 {
            return Err(ConfigError("period_ms must be greater than zero".into()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError("poll_timeout_ms must be greater than zero".into()));
        }
        if self.collectors.is_empty() {
            return Err(ConfigError("at least one collector is required".into()));
        }
        for collector in &self.collectors {
            if collector.period_ms == Some(0) {
                return Err(ConfigError(format!(
                    "collector `{}` period_ms must be greater than zero",
                    collector.kind
                )));
            }
            if collector.per_instance && !collector.kind.has_instances() {
                return Err(ConfigError(format!(
                    "collector `{}` does not support per_instance",
                    collector.kind
                )));
            }
        }
        if self.processing.min_value > self.processing.max_value {
            return Err(ConfigError(
                "processing.min_value must not exceed processing.max_value".into(),
            ));
        }
        self.pipeline.validate()?;
        self.output.validate()
    }
}

/// Built-in data sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorKind {
    Cpu,
    Memory,
    Load,
}

impl CollectorKind {
    /// Whether the source reports several titled instances
    pub fn has_instances(&self) -> bool {
        matches!(self, CollectorKind::Cpu)
    }
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorKind::Cpu => write!(f, "cpu"),
            CollectorKind::Memory => write!(f, "memory"),
            CollectorKind::Load => write!(f, "load"),
        }
    }
}

/// One configured collector
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub kind: CollectorKind,

    /// Fields to keep; empty keeps everything the source provides
    #[serde(default)]
    pub fields: Vec<String>,

    /// Per-collector period override in milliseconds
    #[serde(default)]
    pub period_ms: Option<u64>,

    /// Also emit one nested group per instance, keyed by its title
    /// (`cpu0`, `cpu1`, ...). Only sources with instances support it.
    #[serde(default)]
    pub per_instance: bool,
}

/// Event builder bounds
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_min_value")]
    pub min_value: f64,
    #[serde(default = "default_max_value")]
    pub max_value: f64,
}

fn default_min_value() -> f64 {
    -1e15
}

fn default_max_value() -> f64 {
    1e15
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            min_value: default_min_value(),
            max_value: default_max_value(),
        }
    }
}

/// Output pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_retry_time_ms")]
    pub max_retry_time_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Memory bound for the retry queue
    #[serde(default = "default_max_retry_bytes")]
    pub max_retry_bytes: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_retry_time_ms() -> u64 {
    60_000
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_retry_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            channel_capacity: default_channel_capacity(),
            max_retries: default_max_retries(),
            max_retry_time_ms: default_max_retry_time_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retry_bytes: default_max_retry_bytes(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn max_retry_time(&self) -> Duration {
        Duration::from_millis(self.max_retry_time_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError("pipeline.batch_size must be greater than zero".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError(
                "pipeline.flush_interval_ms must be greater than zero".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError(
                "pipeline.channel_capacity must be greater than zero".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError(
                "pipeline.initial_backoff_ms must not exceed pipeline.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Sink selection; exactly one output is active
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    File {
        #[serde(default = "default_output_path")]
        path: PathBuf,
        #[serde(default = "default_output_filename")]
        filename: String,
        #[serde(default = "default_rotate_every_bytes")]
        rotate_every_bytes: u64,
        #[serde(default = "default_number_of_files")]
        number_of_files: u32,
    },
    Console,
    Http {
        url: String,
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_output_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_filename() -> String {
    BEAT_NAME.to_string()
}

fn default_rotate_every_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_number_of_files() -> u32 {
    7
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::File {
            path: default_output_path(),
            filename: default_output_filename(),
            rotate_every_bytes: default_rotate_every_bytes(),
            number_of_files: default_number_of_files(),
        }
    }
}

impl OutputConfig {
    /// Short name used in logs and health
    pub fn kind(&self) -> &'static str {
        match self {
            OutputConfig::File { .. } => "file",
            OutputConfig::Console => "console",
            OutputConfig::Http { .. } => "http",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            OutputConfig::File {
                filename,
                number_of_files,
                ..
            } => {
                if filename.is_empty() {
                    return Err(ConfigError("output.filename must not be empty".into()));
                }
                if *number_of_files == 0 {
                    return Err(ConfigError(
                        "output.number_of_files must be greater than zero".into(),
                    ));
                }
                Ok(())
            }
            OutputConfig::Console => Ok(()),
            // URL syntax is checked when the sink is built, as a fatal sink error
            OutputConfig::Http { .. } => Ok(()),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_json")]
    pub json: bool,
    /// Log file, directory, or glob pattern such as `logs/*`
    #[serde(default)]
    pub path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
            path: None,
        }
    }
}

impl LoggingConfig {
    /// Resolve the configured path to the file the beat should append to
    pub fn log_file(&self, beat_name: &str) -> Option<PathBuf> {
        self.path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| resolve_log_file(p, beat_name))
    }
}

/// Map a path, directory or glob pattern to a concrete log file
///
/// A glob component means "the directory this pattern lists".
pub fn resolve_log_file(raw: &str, beat_name: &str) -> PathBuf {
    let file_name = format!("{}.log", beat_name);
    let path = Path::new(raw);

    let last_is_glob = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(['*', '?', '[']))
        .unwrap_or(false);

    if last_is_glob {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        return dir.join(file_name);
    }

    if raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR) || path.is_dir() {
        return path.join(file_name);
    }

    path.to_path_buf()
}

/// Optional monitoring endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    5066
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}
