//! Error types for circuitwatch-rs.
//!
//! This module defines the [`enum@Error`] enum representing all failure
//! conditions in the library, from locally rejected `GETINFO` keys to
//! transport loss on the control socket.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io              ◄── socket read/write failures
//!   ├── Config          ◄── invalid configuration
//!   ├── UnsupportedKey  ◄── GETINFO key the controller does not serve
//!   ├── DeprecatedKey   ◄── GETINFO key retired by Tor
//!   ├── UnknownKey      ◄── GETINFO key absent from the capability table
//!   ├── Protocol        ◄── 4xx/5xx reply from Tor
//!   ├── Parse           ◄── reply text violates the control-port grammar
//!   └── ConnectionLost  ◄── command aborted by connection teardown
//! ```
//!
//! The three key-rejection variants are raised before any bytes are written
//! to the socket; everything else reflects what the connection observed.
//!
//! # Example
//!
//! ```rust
//! use circuitwatch_rs::Error;
//!
//! fn is_retryable(err: &Error) -> bool {
//!     matches!(err, Error::Io(_) | Error::ConnectionLost)
//! }
//! ```

use thiserror::Error;

/// Errors that can occur during circuitwatch-rs operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the control socket or a configuration file.
    ///
    /// # Recovery
    ///
    /// Transport failures abort every pending command; open a fresh
    /// connection through the registry to continue.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// # Recovery
    ///
    /// Fix the configuration file or command-line arguments. Not
    /// recoverable without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// A `GETINFO` key this client deliberately does not serve.
    ///
    /// Raised locally by the capability table; nothing is sent to Tor.
    #[error("unsupported GETINFO key: {0}")]
    UnsupportedKey(String),

    /// A `GETINFO` key that Tor has deprecated.
    ///
    /// Raised locally by the capability table; nothing is sent to Tor.
    #[error("deprecated GETINFO key: {0}")]
    DeprecatedKey(String),

    /// A `GETINFO` key absent from the capability table entirely.
    ///
    /// Raised locally; nothing is sent to Tor.
    #[error("unknown GETINFO key: {0}")]
    UnknownKey(String),

    /// An error reply (4xx or 5xx) from the control port.
    ///
    /// Carries the full server text so callers can inspect the reason,
    /// e.g. `515 Authentication failed`.
    #[error("control protocol error {status}: {message}")]
    Protocol {
        /// Three-digit status code from the reply's final line.
        status: u16,
        /// Complete reply text as received.
        message: String,
    },

    /// Reply text that could not be tokenized against the reply grammar.
    #[error("reply parse error: {0}")]
    Parse(String),

    /// The connection was closed while a command was outstanding.
    ///
    /// Every pending command receives this exactly once when the socket
    /// is torn down, whether by [`close`](crate::Controller::close) or by
    /// transport failure.
    #[error("connection to the control port was lost")]
    ConnectionLost,
}

/// Result type alias for circuitwatch-rs operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_errors_carry_key() {
        let err = Error::UnsupportedKey("entry-guards".to_string());
        assert!(err.to_string().contains("entry-guards"));

        let err = Error::DeprecatedKey("network-status".to_string());
        assert!(err.to_string().contains("network-status"));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = Error::Protocol {
            status: 515,
            message: "515 Authentication failed".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("515"));
        assert!(text.contains("Authentication failed"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
