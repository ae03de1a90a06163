//! Tracing subscriber setup for the harness binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

use crate::config::EnvParser;

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Set by [`LogConfig::with_level`]; `level` then wins over `RUST_LOG`.
    pub level_forced: bool,
    pub format: LogFormat,
    /// Write human-facing logs to stderr.
    pub stderr: bool,
    /// Additional JSON log file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Read `LIVESUITE_LOG_LEVEL`, `LIVESUITE_LOG_FORMAT` and
    /// `LIVESUITE_LOG_FILE`, falling back to `default_level`.
    ///
    /// Invalid values are ignored in favour of the defaults; logging must
    /// come up before anything can report configuration errors.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).into_value();
        let format = match parser
            .get_string("LOG_FORMAT", "pretty")
            .into_value()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = parser
            .get_optional_string("LOG_FILE")
            .into_value()
            .map(PathBuf::from);

        Self {
            level,
            level_forced: false,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self.level_forced = true;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

/// Keeps non-blocking writers flushing until dropped.
#[must_use = "dropping the guards stops background log flushing"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    if config.stderr {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        layers.push(match config.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Pretty => layer.boxed(),
        });
    }

    if let Some(path) = &config.file {
        let (dir, name) = split_log_path(path)?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .boxed(),
        );
    }

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = resolve_filter(config, rust_log.as_deref())?;

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuards { _guards: guards })
}

/// `RUST_LOG` when set and valid, unless the level was forced.
fn resolve_filter(config: &LogConfig, rust_log: Option<&str>) -> Result<EnvFilter> {
    if !config.level_forced
        && let Some(directive) = rust_log
        && let Ok(filter) = EnvFilter::try_new(directive)
    {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log filter '{}'", config.level))
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .with_context(|| format!("log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}
