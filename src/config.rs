//! Configuration module for the forward-relay collector.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::sink::OutputKind;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the collector
#[derive(Parser, Debug)]
#[command(name = "forward-relay")]
#[command(author = "forward-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A forward protocol log collector", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host or address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum pending bytes for a single frame
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Where decoded entries go
    #[arg(short, long, value_enum)]
    pub output: Option<OutputKind>,

    /// Seconds between metric log lines (0 = disabled)
    #[arg(long)]
    pub metrics_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host or address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum pending bytes for a single frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Output configuration
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output")]
    pub kind: OutputKind,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: default_output(),
        }
    }
}

/// Metrics reporting configuration
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Seconds between metric log lines
    #[serde(default = "default_metrics_interval")]
    pub interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: default_metrics_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    24224
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_output() -> OutputKind {
    OutputKind::Stdout
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub output: OutputKind,
    pub metrics_interval: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                host: None,
                port: None,
                max_connections: None,
                max_frame_size: None,
                output: None,
                metrics_interval: None,
                log_level: default_log_level(),
            },
            TomlConfig::default(),
        )
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.server.max_frame_size),
            output: cli.output.unwrap_or(toml_config.output.kind),
            metrics_interval: cli
                .metrics_interval
                .unwrap_or(toml_config.metrics.interval),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// `host:port` string to bind.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 24224);
        assert_eq!(config.server.max_connections, 10000);
        assert_eq!(config.output.kind, OutputKind::Stdout);
        assert_eq!(config.metrics.interval, 60);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 24225
            max_frame_size = 1048576

            [output]
            kind = "log"

            [metrics]
            interval = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 24225);
        assert_eq!(config.server.max_frame_size, 1048576);
        assert_eq!(config.output.kind, OutputKind::Log);
        assert_eq!(config.metrics.interval, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from(["forward-relay", "--port", "9999", "--output", "discard"]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            host = "10.0.0.1"
            port = 24224
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 9999);
        assert_eq!(config.output, OutputKind::Discard);
        assert_eq!(config.bind_address(), "10.0.0.1:9999");
    }

    #[test]
    fn test_bind_address_ipv6() {
        let config = Config {
            host: "::1".to_string(),
            port: 24224,
            ..Config::default()
        };
        assert_eq!(config.bind_address(), "[::1]:24224");
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["forward-relay", "-c", "/nonexistent/relay.toml"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
