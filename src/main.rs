//! circuitwatch-rs CLI application entry point.
//!
//! Connects to a running Tor's control port and prints, for each domain a
//! circuit starts carrying, the three relays on that circuit.
//!
//! # Usage
//!
//! ```bash
//! # Connect to Tor Browser's control port with defaults (127.0.0.1:9151)
//! circuitwatch-rs
//!
//! # System tor daemon with a control password
//! circuitwatch-rs --control-port 9051 --control-pass opensesame
//!
//! # Generate a default configuration file
//! circuitwatch-rs --generate-config circuitwatch.conf
//!
//! # Verbose logging to a file
//! circuitwatch-rs --loglevel DEBUG --logfile /tmp/circuitwatch.log
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |

use clap::Parser;
use std::process::ExitCode;

use circuitwatch_rs::{config, logger, CircuitWatch, CliArgs, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> circuitwatch_rs::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("circuitwatch-rs {} starting", env!("CARGO_PKG_VERSION")),
    );
    logger::plog(
        LogLevel::Debug,
        &format!(
            "Control port: {}:{}",
            config.control_ip, config.control_port
        ),
    );

    let mut watch = CircuitWatch::from_config(config);
    watch.run().await
}
