//! Configuration management for circuitwatch-rs.
//!
//! Configuration can be loaded from multiple sources, applied in order of
//! precedence (later sources override earlier ones):
//!
//! ```text
//! ┌─────────────────┐
//! │    Defaults     │ ◄── control port 127.0.0.1:9151, NOTICE logging
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: circuitwatch.conf)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Environment   │ ◄── CIRCUITWATCH_CONFIG selects the file
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  CLI Arguments  │ ◄── highest priority
//! └─────────────────┘
//! ```
//!
//! # Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `control_ip` | `127.0.0.1` | Control-port host |
//! | `control_port` | `9151` | Control-port TCP port |
//! | `control_pass` | none | Control-port authentication secret |
//! | `loglevel` | `NOTICE` | Log verbosity |
//! | `logfile` | stdout | Log destination file |
//!
//! # Example
//!
//! ```rust
//! use circuitwatch_rs::Config;
//!
//! let config = Config::default();
//! assert_eq!(config.control_ip, "127.0.0.1");
//! assert_eq!(config.control_port, 9151);
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Log level for circuitwatch-rs output.
///
/// From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) >
/// [`Notice`](LogLevel::Notice) > [`Warn`](LogLevel::Warn) >
/// [`Error`](LogLevel::Error)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Main configuration struct for circuitwatch-rs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// IP address (or hostname) of the Tor control port.
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Port number of the Tor control port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Password for control-port authentication. May be empty when the
    /// control port requires no authentication.
    #[serde(default)]
    pub control_pass: Option<String>,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None logs to stdout.
    #[serde(default)]
    pub logfile: Option<String>,
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    9151
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: default_control_port(),
            control_pass: None,
            loglevel: LogLevel::default(),
            logfile: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.control_ip.is_empty() {
            return Err(Error::Config("control_ip must not be empty".to_string()));
        }
        if self.control_port == 0 {
            return Err(Error::Config("control_port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Resolve hostname to IP address if `control_ip` is a domain name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if hostname resolution fails.
    pub fn resolve_control_ip(&mut self) -> Result<()> {
        if self.control_ip.parse::<IpAddr>().is_err() {
            let addr = format!("{}:0", self.control_ip)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!(
                        "failed to resolve hostname {}: {}",
                        self.control_ip, e
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no addresses found for hostname {}",
                        self.control_ip
                    ))
                })?;
            self.control_ip = addr.ip().to_string();
        }
        Ok(())
    }
}

/// Command-line arguments for circuitwatch-rs.
///
/// Arguments override configuration file values; see the module docs for
/// the full precedence order.
#[derive(Parser, Debug)]
#[command(name = "circuitwatch-rs")]
#[command(about = "Per-domain Tor circuit monitoring over the control port")]
#[command(version)]
#[command(
    long_about = "circuitwatch-rs connects to a running Tor's control port, follows circuit \
    and stream events, and reports which three relays carry the connection to each domain."
)]
pub struct CliArgs {
    /// Path to configuration file.
    ///
    /// TOML configuration file containing all settings. Command-line
    /// arguments override values from this file.
    #[arg(
        long = "config",
        env = "CIRCUITWATCH_CONFIG",
        default_value = "circuitwatch.conf"
    )]
    pub config_file: PathBuf,

    /// Write default config to file and exit.
    #[arg(long = "generate-config")]
    pub generate_config: Option<PathBuf>,

    /// IP address of the Tor control port.
    ///
    /// Can be an IPv4 address, IPv6 address, or hostname (will be
    /// resolved). Default is 127.0.0.1.
    #[arg(long)]
    pub control_ip: Option<String>,

    /// Tor control port number.
    ///
    /// Typically 9151 for Tor Browser and 9051 for the system daemon.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Tor control port password.
    #[arg(long)]
    pub control_pass: Option<String>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout.
    #[arg(long)]
    pub logfile: Option<String>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref control_ip) = self.control_ip {
            config.control_ip = control_ip.clone();
        }
        if let Some(control_port) = self.control_port {
            config.control_port = control_port;
        }
        if let Some(ref control_pass) = self.control_pass {
            config.control_pass = Some(control_pass.clone());
        }
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// Starts with defaults, applies the config file if it exists, then the
/// CLI arguments, then resolves and validates the result.
///
/// # Errors
///
/// Returns [`Error::Config`] if the configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.resolve_control_ip()?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.control_ip, "127.0.0.1");
        assert_eq!(config.control_port, 9151);
        assert!(config.control_pass.is_none());
        assert_eq!(config.loglevel, LogLevel::Notice);
        assert!(config.logfile.is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.control_port = 9051;
        config.control_pass = Some("opensesame".to_string());
        config.loglevel = LogLevel::Debug;

        let toml = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "control_port = 9051").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.control_port, 9051);
        // Unspecified fields keep their defaults.
        assert_eq!(config.control_ip, "127.0.0.1");
        assert_eq!(config.loglevel, LogLevel::Notice);
    }

    #[test]
    fn test_from_file_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "control_port = \"not a port\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.control_port = 0;
        assert!(config.validate().is_err());

        config.control_port = 9151;
        config.control_ip = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs {
            config_file: PathBuf::from("does-not-exist.conf"),
            generate_config: None,
            control_ip: Some("10.0.0.5".to_string()),
            control_port: Some(9051),
            control_pass: Some("pw".to_string()),
            loglevel: Some("debug".to_string()),
            logfile: None,
        };

        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.control_ip, "10.0.0.5");
        assert_eq!(config.control_port, 9051);
        assert_eq!(config.control_pass.as_deref(), Some("pw"));
        assert_eq!(config.loglevel, LogLevel::Debug);
    }

    #[test]
    fn test_loglevel_parsing() {
        assert_eq!("NOTICE".parse::<LogLevel>().unwrap(), LogLevel::Notice);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("err".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_loglevel_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Notice < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
