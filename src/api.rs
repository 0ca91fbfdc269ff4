//! High-level application facade.
//!
//! [`CircuitWatch`] wires the pieces together for callers that just want
//! the monitoring behavior: open a registry-managed connection, start the
//! circuit tracker, and report each resolved domain until shutdown.
//!
//! ```rust,no_run
//! use circuitwatch_rs::{CircuitWatch, Config};
//!
//! #[tokio::main]
//! async fn main() -> circuitwatch_rs::Result<()> {
//!     let config = Config::default();
//!     let mut watch = CircuitWatch::from_config(config);
//!     watch.run().await
//! }
//! ```

use zeroize::Zeroize;

use crate::config::{Config, LogLevel};
use crate::connection::ControllerRegistry;
use crate::error::Result;
use crate::logger::plog;
use crate::tracker::{CircuitTracker, NodesUpdate};

/// A control-port password that is wiped from memory on drop.
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Wraps a password.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// The password text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// User-facing label for a two-letter country code.
///
/// Localized country names are the display layer's concern; the fallback
/// contract is the uppercased code, which is what this helper provides.
pub fn country_label(code: &str) -> String {
    code.to_uppercase()
}

fn render_update(update: &NodesUpdate) -> String {
    let relays: Vec<String> = update
        .nodes
        .iter()
        .map(|node| {
            format!(
                "{} ({}, {})",
                node.nickname,
                node.ip,
                country_label(&node.country_code)
            )
        })
        .collect();
    format!("{}: {}", update.domain, relays.join(", "))
}

/// Connects to Tor, tracks circuits, and reports resolved domains.
pub struct CircuitWatch {
    config: Config,
    registry: ControllerRegistry,
    password: Option<SecurePassword>,
}

impl CircuitWatch {
    /// Creates the facade. Connection happens in [`run`](Self::run).
    pub fn from_config(config: Config) -> Self {
        let password = config.control_pass.clone().map(SecurePassword::new);
        Self {
            config,
            registry: ControllerRegistry::new(),
            password,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs until Ctrl-C: connects, subscribes, and logs one line per
    /// resolved domain.
    ///
    /// # Errors
    ///
    /// Connection and authentication errors from
    /// [`ControllerRegistry::open`].
    pub async fn run(&mut self) -> Result<()> {
        let secret = self
            .password
            .as_ref()
            .map(|password| password.as_str().to_string())
            .unwrap_or_default();
        let controller = self
            .registry
            .open(&self.config.control_ip, self.config.control_port, &secret)
            .await?;

        match controller.get_info("version").await {
            Ok(version) => plog(
                LogLevel::Notice,
                &format!(
                    "Connected to Tor {} at {}",
                    version.as_str().unwrap_or("(unknown)"),
                    controller.endpoint()
                ),
            ),
            Err(e) => plog(
                LogLevel::Warn,
                &format!("Connected, but version query failed: {}", e),
            ),
        }

        let mut tracker = CircuitTracker::launch(controller);
        loop {
            tokio::select! {
                update = tracker.next_update() => match update {
                    Some(update) => plog(LogLevel::Notice, &render_update(&update)),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    plog(LogLevel::Notice, "Interrupted; shutting down");
                    break;
                }
            }
        }

        tracker.shutdown().await;
        self.registry.close_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::NodeInfo;

    #[test]
    fn test_secure_password_debug_redacted() {
        let password = SecurePassword::new("secret123".to_string());
        let debug_str = format!("{:?}", password);
        assert!(!debug_str.contains("secret123"));
        assert!(debug_str.contains("REDACTED"));
    }

    #[test]
    fn test_secure_password_as_str() {
        let password = SecurePassword::new("secret123".to_string());
        assert_eq!(password.as_str(), "secret123");
    }

    #[test]
    fn test_country_label_uppercases() {
        assert_eq!(country_label("de"), "DE");
        assert_eq!(country_label("US"), "US");
    }

    #[test]
    fn test_render_update() {
        let node = |nickname: &str, ip: &str, cc: &str| NodeInfo {
            fingerprint: "A".repeat(40),
            nickname: nickname.to_string(),
            ip: ip.to_string(),
            country_code: cc.to_string(),
        };
        let update = NodesUpdate {
            domain: "example.com".to_string(),
            nodes: [
                node("alpha", "10.0.0.1", "de"),
                node("beta", "10.0.0.2", "fr"),
                node("gamma", "10.0.0.3", "us"),
            ],
        };
        assert_eq!(
            render_update(&update),
            "example.com: alpha (10.0.0.1, DE), beta (10.0.0.2, FR), gamma (10.0.0.3, US)"
        );
    }

    #[test]
    fn test_from_config_keeps_config() {
        let mut config = Config::default();
        config.control_pass = Some("pw".to_string());
        let watch = CircuitWatch::from_config(config);
        assert_eq!(watch.config().control_port, 9151);
    }
}
