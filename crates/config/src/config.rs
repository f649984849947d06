//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but cannot be used
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Filesystem locations used by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory scanned for Markdown sources
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    /// Output root: artifacts, per-job logs and the job cache live here
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Active LaTeX template (None = convert without a template)
    #[serde(default = "default_template")]
    pub template: Option<PathBuf>,
    /// PID file written in daemon mode
    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("./input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_template() -> Option<PathBuf> {
    Some(PathBuf::from("./app/template.tex"))
}

fn default_pidfile() -> PathBuf {
    PathBuf::from("/var/run/md2pdf.pid")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            template: default_template(),
            pidfile: default_pidfile(),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Maximum concurrent conversion jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Capacity of the shared intake queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    100
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Conversion engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionConfig {
    /// Pandoc executable name or path
    #[serde(default = "default_pandoc_binary")]
    pub pandoc_binary: String,
    /// LaTeX engines in fallback order
    #[serde(default = "default_pdf_engines")]
    pub pdf_engines: Vec<String>,
    /// Timeout for a single engine attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Proceed with a template that fails validation
    #[serde(default)]
    pub bypass_validation: bool,
    /// Minimum free space on the output volume
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,
    /// Cache terminal failures so they are not retried without force
    #[serde(default)]
    pub cache_failures: bool,
}

fn default_pandoc_binary() -> String {
    "pandoc".to_string()
}

fn default_pdf_engines() -> Vec<String> {
    vec![
        "xelatex".to_string(),
        "lualatex".to_string(),
        "pdflatex".to_string(),
    ]
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

fn default_min_free_disk_mb() -> u64 {
    100
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            pandoc_binary: default_pandoc_binary(),
            pdf_engines: default_pdf_engines(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            bypass_validation: false,
            min_free_disk_mb: default_min_free_disk_mb(),
            cache_failures: false,
        }
    }
}

/// Watch loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Seconds between directory sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    5
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// HTTP listeners for the control API and metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            metrics_port: default_metrics_port(),
            bind_address: default_bind_address(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
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
    /// - INPUT_DIR -> paths.input_dir
    /// - OUTPUT_DIR -> paths.output_dir
    /// - TEMPLATE_FILE -> paths.template (empty string clears it)
    /// - PIDFILE -> paths.pidfile
    /// - WORKERS -> workers.max_concurrent_jobs
    /// - QUEUE_CAPACITY -> workers.queue_capacity
    /// - PANDOC_BINARY -> conversion.pandoc_binary
    /// - PANDOC_TIMEOUT -> conversion.attempt_timeout_secs
    /// - BYPASS_TEMPLATE_VALIDATION -> conversion.bypass_validation
    /// - WATCH_INTERVAL -> watch.interval_secs
    /// - API_PORT -> server.api_port
    /// - METRICS_PORT -> server.metrics_port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("TEMPLATE_FILE") {
            self.paths.template = if val.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = env::var("PIDFILE") {
            self.paths.pidfile = PathBuf::from(val);
        }

        if let Ok(val) = env::var("WORKERS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.workers.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                self.workers.queue_capacity = capacity;
            }
        }

        if let Ok(val) = env::var("PANDOC_BINARY") {
            if !val.trim().is_empty() {
                self.conversion.pandoc_binary = val;
            }
        }

        if let Ok(val) = env::var("PANDOC_TIMEOUT") {
            if let Ok(secs) = val.parse::<u64>() {
                self.conversion.attempt_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("BYPASS_TEMPLATE_VALIDATION") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.conversion.bypass_validation = true,
                "false" | "0" | "no" => self.conversion.bypass_validation = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("WATCH_INTERVAL") {
            if let Ok(secs) = val.parse::<u64>() {
                self.watch.interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("API_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.api_port = port;
            }
        }

        if let Ok(val) = env::var("METRICS_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.metrics_port = port;
            }
        }
    }

    /// Reject values that parse but would leave the daemon unable to work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid("workers.queue_capacity must be at least 1".into()));
        }
        if self.conversion.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "conversion.attempt_timeout_secs must be at least 1".into(),
            ));
        }
        if self.conversion.pandoc_binary.trim().is_empty() {
            return Err(ConfigError::Invalid("conversion.pandoc_binary is empty".into()));
        }
        if self.conversion.pdf_engines.is_empty() {
            return Err(ConfigError::Invalid("conversion.pdf_engines is empty".into()));
        }
        if self.conversion.pdf_engines.iter().any(|e| e.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "conversion.pdf_engines contains an empty name".into(),
            ));
        }
        if self.paths.input_dir.as_os_str().is_empty() || self.paths.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.input_dir and paths.output_dir must be set".into()));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
