//! File-based logging with per-component log files.
//!
//! Every event goes to the console (optional) and to the root `trellis.log`.
//! Consensus, session and compaction events are additionally routed by their
//! `tracing` target into their own rolling files:
//!
//! | Log File            | Component                  | Target Prefixes                      |
//! |---------------------|----------------------------|--------------------------------------|
//! | trellis.log         | Root logger (everything)   | (all)                                |
//! | protocol-raft.log   | Consensus core             | trellis_consistency::raft            |
//! | session.log         | Client sessions            | trellis_consistency::session, client |
//! | compaction.log      | Log compaction             | trellis_consistency::compaction      |
//!
//! Log files are stored in `~/trellis/logs` by default.
//! Override with `TRELLIS_LOG_DIR` or `logging.dir` in `conf/trellis.yml`.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const ROOT_LOG_FILE: &str = "trellis.log";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "protocol-raft.log",
        targets: &["trellis_consistency::raft"],
    },
    ComponentLogDef {
        file_name: "session.log",
        targets: &[
            "trellis_consistency::session",
            "trellis_consistency::client",
        ],
    },
    ComponentLogDef {
        file_name: "compaction.log",
        targets: &["trellis_consistency::compaction"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    /// Single file
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/trellis/logs", home))
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base log directory (default: `~/trellis/logs`)
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: true,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Defaults overridden by `TRELLIS_LOG_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Settings from the configuration file.
    pub fn from_config(
        log_dir: Option<PathBuf>,
        console_output: bool,
        file_logging: bool,
        level: &str,
        rotation: LogRotation,
    ) -> Self {
        let level = level.parse().unwrap_or(Level::INFO);
        Self {
            log_dir: log_dir.unwrap_or_else(default_log_dir),
            console_output,
            console_level: level,
            file_logging,
            file_level: level,
            rotation,
        }
    }

    /// Applies `TRELLIS_LOG_DIR`, `TRELLIS_LOG_LEVEL`, `TRELLIS_LOG_FILE_LEVEL`,
    /// `TRELLIS_LOG_CONSOLE` and `TRELLIS_LOG_FILE` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("TRELLIS_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(console) = std::env::var("TRELLIS_LOG_CONSOLE")
            .ok()
            .map(|v| !v.eq_ignore_ascii_case("false") && v != "0")
        {
            self.console_output = console;
        }
        if let Some(file) = env_flag("TRELLIS_LOG_FILE") {
            self.file_logging = file;
        }
        if let Some(level) = std::env::var("TRELLIS_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.console_level = level;
            self.file_level = level;
        }
        if let Some(level) = std::env::var("TRELLIS_LOG_FILE_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.file_level = level;
        }
        self
    }
}

/// Keeps the non-blocking file writers alive. Dropping it flushes buffered
/// output, so hold it until the process exits.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

fn file_layer(
    config: &LoggingConfig,
    file_name: &str,
    guards: &mut Vec<WorkerGuard>,
) -> impl Layer<Registry> + Send + Sync + 'static {
    let appender = RollingFileAppender::new(config.rotation.into(), &config.log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);
    fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level for the console and
/// the root file. Component files capture every level of their targets.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        layers.push(Box::new(
            file_layer(config, ROOT_LOG_FILE, &mut guards).with_filter(root_filter),
        ));

        for component in COMPONENT_LOGS {
            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::TRACE);
            }
            layers.push(Box::new(
                file_layer(config, component.file_name, &mut guards).with_filter(targets),
            ));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
