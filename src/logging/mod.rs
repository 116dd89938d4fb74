//! Logging configuration and initialization
//!
//! The allocator itself only emits `tracing` events; binaries and tests that
//! want to see them install a subscriber through this module. Human-readable
//! and JSON output are supported, optionally mirrored to a JSON log file.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "warn,memforge=trace")
//! - `MEMFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `MEMFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `MEMFORGE_LOG_FILE`: Optional file path for log output (JSON format)

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Set once a subscriber has been installed
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "MEMFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "MEMFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "MEMFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    #[error("failed to install subscriber: {0}")]
    InitFailed(String),
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter directive
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console output
    pub with_file_info: bool,
    /// Emit span close events
    pub with_span_events: bool,
    /// Mirror events as JSON into this file
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Defaults overlaid with `MEMFORGE_LOG_*`
    pub fn from_env() -> Self {
        let mut config = LoggingConfig::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| LogLevel::parse(&s)) {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV).ok().and_then(|s| LogFormat::parse(&s)) {
            config.format = format;
        }
        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            config.log_file = Some(PathBuf::from(path));
        }
        config
    }
}

/// Initialize logging from the environment, ignoring failures
///
/// Idempotent: only the first call installs a subscriber.
pub fn init_logging_default() {
    init_with_config(&LoggingConfig::from_env());
}

/// Initialize logging with a custom configuration
///
/// Idempotent. Failures (for example an unwritable log file) are reported on
/// stderr and leave logging disabled.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        if let Err(e) = init_with_config_internal(config) {
            eprintln!("memforge: logging disabled: {}", e);
        }
    });
}

/// Check if a subscriber has been installed by this module
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

fn init_with_config_internal(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;
    let file = config.log_file.as_deref().map(open_log_file).transpose()?;

    // Optional layers: a `None` layer is a no-op
    let file_layer = file.map(|file| {
        fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(file))
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_span_events(span_events(config.with_span_events))
    });

    let (human, json) = match config.format {
        LogFormat::Human => (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(human)
        .with(json)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::InitFailed(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LoggingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// RUST_LOG wins, then the configured level
fn build_env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    Ok(EnvFilter::new(level.as_filter_str()))
}
