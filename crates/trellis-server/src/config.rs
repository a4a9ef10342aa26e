//! Configuration management for the Trellis server
//!
//! Settings come from `conf/trellis.yml`, overlaid by `TRELLIS_`-prefixed
//! environment variables (`TRELLIS_CLUSTER__REPLICAS=5`) and finally by
//! command line flags.

use std::path::PathBuf;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use trellis_consistency::ClusterConfig;

use crate::startup::{LogRotation, LoggingConfig};

pub const DEFAULT_CONFIG_FILE: &str = "conf/trellis.yml";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "trellis-server", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "TRELLIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Replicas per partition
    #[arg(short = 'r', long = "replicas")]
    pub replicas: Option<u64>,

    /// Data directory; switches replicas to file storage
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub dir: Option<PathBuf>,
    pub level: String,
    pub console: bool,
    pub file: bool,
    pub rotation: LogRotation,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: None,
            level: "info".to_string(),
            console: true,
            file: true,
            rotation: LogRotation::Daily,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub logging: LogSettings,
    pub cluster: ClusterConfig,
}

impl ServerConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        // An explicitly named file must exist; the default one is optional
        let file = match &cli.config {
            Some(path) => File::from(path.as_path()).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut builder = Config::builder().add_source(file).add_source(
            Environment::with_prefix("TRELLIS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(replicas) = cli.replicas {
            builder = builder.set_override("cluster.replicas", replicas)?;
        }
        if let Some(dir) = &cli.data_dir {
            builder = builder
                .set_override("cluster.raft.data_dir", dir.display().to_string())?
                .set_override("cluster.storage", "file")?;
        }
        if let Some(level) = &cli.log_level {
            builder = builder.set_override("logging.level", level.as_str())?;
        }

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.cluster.validate()?;
        Ok(config)
    }

    /// File settings with `TRELLIS_LOG_*` variables applied on top
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.logging.dir.clone(),
            self.logging.console,
            self.logging.file,
            &self.logging.level,
            self.logging.rotation,
        )
        .with_env_overrides()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use trellis_consistency::StorageMode;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
logging:
  level: debug
  rotation: hourly
cluster:
  replicas: 5
  groups:
    - name: default
      partitions: 4
  raft:
    tick_interval_ms: 20
    election_timeout_ms: 400
    heartbeat_interval_ms: 60
"#,
        );
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = ServerConfig::load(&cli).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.rotation, LogRotation::Hourly);
        assert_eq!(config.cluster.replicas, 5);
        assert_eq!(config.cluster.groups[0].partitions, 4);
        assert_eq!(config.cluster.raft.election_timeout_ms, 400);
        // Unset sections keep their defaults
        assert_eq!(config.cluster.storage, StorageMode::Memory);
        assert_eq!(config.cluster.session.timeout_ms, 5000);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config("cluster:\n  replicas: 5\n");
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            replicas: Some(1),
            data_dir: Some(PathBuf::from("/var/lib/trellis")),
            log_level: Some("warn".to_string()),
        };

        let config = ServerConfig::load(&cli).unwrap();
        assert_eq!(config.cluster.replicas, 1);
        assert_eq!(config.cluster.storage, StorageMode::File);
        assert_eq!(config.cluster.raft.data_dir, PathBuf::from("/var/lib/trellis"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_invalid_cluster_is_rejected() {
        let file = write_config(
            "cluster:\n  raft:\n    heartbeat_interval_ms: 500\n    election_timeout_ms: 100\n",
        );
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(ServerConfig::load(&cli).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/trellis.yml")),
            ..Default::default()
        };
        assert!(ServerConfig::load(&cli).is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["trellis-server", "--replicas", "3", "--log-level", "debug"]);
        assert_eq!(cli.replicas, Some(3));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.data_dir.is_none());
    }
}
