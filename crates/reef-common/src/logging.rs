//! Process-wide `tracing` setup
//!
//! [`init_logging`] installs one subscriber per process. Lines go to stdout,
//! to a daily rolling file under [`LogConfig::log_dir`], or to both, rendered
//! as text or JSON. Import code logs through the structured macros:
//!
//! ```rust,ignore
//! info!(profile = %profile.id, file = %name, rows, "Batch written");
//! ```
//!
//! ```no_run
//! use reef_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("Import started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{format::FmtSpan, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type Sink = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Resolve `raw` against a table of accepted spellings, case-insensitively
fn named<T: Copy>(what: &str, raw: &str, table: &[(&str, T)]) -> Result<T> {
    let wanted = raw.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow!("unknown {} '{}'", what, raw))
}

/// Minimum severity written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        named(
            "log level",
            s,
            &[
                ("trace", Self::Trace),
                ("debug", Self::Debug),
                ("info", Self::Info),
                ("warn", Self::Warn),
                ("warning", Self::Warn),
                ("error", Self::Error),
            ],
        )
    }
}

/// Destination of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn writes_stdout(self) -> bool {
        self != Self::File
    }

    fn writes_file(self) -> bool {
        self != Self::Console
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        named(
            "log output",
            s,
            &[
                ("console", Self::Console),
                ("stdout", Self::Console),
                ("file", Self::File),
                ("both", Self::Both),
                ("all", Self::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        named(
            "log format",
            s,
            &[("text", Self::Text), ("pretty", Self::Text), ("json", Self::Json)],
        )
    }
}

/// Subscriber settings for a Reef process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    pub log_dir: PathBuf,
    /// Rolling files are named `<prefix>.<yyyy-mm-dd>`
    pub log_file_prefix: String,
    /// Comma separated directives layered on top of `level`, e.g. `sqlx=warn`
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            log_dir: "./logs".into(),
            log_file_prefix: "reef".into(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Defaults overridden by `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`,
    /// `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER` and the boolean
    /// `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS`, `LOG_INCLUDE_TARGETS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(format!("LOG_{}", key)).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let flag = |key: &str, current: bool| -> Result<bool> {
            var(key).map_or(Ok(current), |raw| {
                raw.trim()
                    .parse::<bool>()
                    .with_context(|| format!("LOG_{} must be true or false", key))
            })
        };

        if let Some(raw) = var("LEVEL") {
            config.level = raw.parse()?;
        }
        if let Some(raw) = var("OUTPUT") {
            config.output = raw.parse()?;
        }
        if let Some(raw) = var("FORMAT") {
            config.format = raw.parse()?;
        }
        if let Some(dir) = var("DIR") {
            config.log_dir = dir.into();
        }
        if let Some(prefix) = var("FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }
        config.filter_directives = var("FILTER").or(config.filter_directives);
        config.include_location = flag("INCLUDE_LOCATION", config.include_location)?;
        config.include_thread_ids = flag("INCLUDE_THREAD_IDS", config.include_thread_ids)?;
        config.include_targets = flag("INCLUDE_TARGETS", config.include_targets)?;

        Ok(config)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder(Self::default())
    }

    fn filter(&self) -> Result<EnvFilter> {
        let extra = self.filter_directives.as_deref().unwrap_or_default();
        extra
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(
                EnvFilter::from_default_env().add_directive(self.level.as_level().into()),
                |filter, directive| {
                    let parsed = directive
                        .parse::<Directive>()
                        .with_context(|| format!("bad log filter directive '{}'", directive))?;
                    Ok(filter.add_directive(parsed))
                },
            )
    }

    fn sink<W>(&self, writer: W, colour: bool) -> Sink
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(colour)
            .with_target(self.include_targets)
            .with_thread_ids(self.include_thread_ids)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_span_events(FmtSpan::CLOSE);

        if self.format == LogFormat::Json {
            base.json().boxed()
        } else {
            base.boxed()
        }
    }
}

pub struct LogConfigBuilder(LogConfig);

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.0.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.0.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.0.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.0.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.0.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.0.filter_directives = Some(directives.into());
        self
    }

    pub fn include_location(mut self, on: bool) -> Self {
        self.0.include_location = on;
        self
    }

    pub fn build(self) -> LogConfig {
        self.0
    }
}

/// Flushes the rolling file writer when dropped
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber; errors if one is already set
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.filter()?;
    let mut sinks: Vec<Sink> = Vec::with_capacity(2);

    if config.output.writes_stdout() {
        sinks.push(config.sink(std::io::stdout, true));
    }

    let file = if config.output.writes_file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("cannot create log directory {}", config.log_dir.display()))?;
        let rolling = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(rolling);
        sinks.push(config.sink(writer, false));
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(sinks)
        .with(filter)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _file: file })
}
