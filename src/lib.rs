//! # circuitwatch-rs
//!
//! A Rust client for Tor's text-based control port, plus the tracking
//! logic that answers: which three relays are currently carrying the
//! connection to a given domain?
//!
//! # Overview
//!
//! The library has two halves:
//!
//! - a **control-port protocol engine**: a persistent line-oriented
//!   full-duplex connection that authenticates to a local Tor, serializes
//!   synchronous commands against pipelined replies (strict FIFO, one in
//!   flight), demultiplexes spontaneous `650` events from reply traffic,
//!   and parses structured `GETINFO` responses including multi-line
//!   bodies;
//! - a **circuit/stream tracker** that follows `CIRC` and `STREAM`
//!   events, binds each circuit to the first domain it carries, resolves
//!   the circuit's three relays to nickname/IP/country, and notifies the
//!   display layer.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`framing`] | CRLF line framing and reply/event message assembly |
//! | [`dispatch`] | Predicate-routed message dispatch |
//! | [`events`] | `650` event tokenization and typed CIRC/STREAM records |
//! | [`getinfo`] | `GETINFO` capability table, codec, and value parsers |
//! | [`connection`] | [`Controller`] facade, command pipeline, registry |
//! | [`tracker`] | Circuit→domain→relays tracking and notifications |
//! | [`api`] | High-level [`CircuitWatch`] facade |
//! | [`config`] | Configuration (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **SOCKS or relay traffic**: it is strictly a control-channel consumer
//! - **Path selection or relay policy**: circuits are observed, never built
//! - **Descriptor validation or cryptography**: Tor's job, not this crate's
//! - **Reconnection**: a lost connection stays lost until the caller opens
//!   a new one
//! - **State persistence**: all tracking state is in-memory
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use circuitwatch_rs::{ControllerRegistry, CircuitTracker};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> circuitwatch_rs::Result<()> {
//!     let registry = ControllerRegistry::new();
//!     let controller = registry.open("127.0.0.1", 9151, "").await?;
//!
//!     let version = controller.get_info("version").await?;
//!     println!("Tor {}", version.as_str().unwrap_or("?"));
//!
//!     let mut tracker = CircuitTracker::launch(controller);
//!     while let Some(update) = tracker.next_update().await {
//!         println!("{} is carried by {:?}", update.domain, update.nodes);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Watch Tor Browser's circuits
//! circuitwatch-rs
//!
//! # System daemon on 9051 with a password
//! circuitwatch-rs --control-port 9051 --control-pass opensesame
//! ```
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec)

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod framing;
pub mod getinfo;
pub mod logger;
pub mod tracker;

pub use api::{country_label, CircuitWatch, SecurePassword};
pub use config::{CliArgs, Config, LogLevel};
pub use connection::{Controller, ControllerRegistry, ErrorSink, EventSubscription};
pub use dispatch::{Dispatcher, RegistrationId};
pub use error::{Error, Result};
pub use events::{
    CircuitEvent, CircuitStatus, EventRecord, EventType, PathHop, StreamEvent, StreamStatus,
};
pub use framing::{ControlMessage, LineFramer, MessageAssembler};
pub use getinfo::{InfoValue, KeySupport, RouterStatusEntry, ValueParser};
pub use tracker::{CircuitRecord, CircuitTracker, NodeInfo, NodesUpdate, TrackerHandle};
