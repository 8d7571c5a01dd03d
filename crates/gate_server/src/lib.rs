//! # Gate Server
//!
//! A framed TCP gate assembled from the [`module_runtime`] and
//! [`wire_protocol`] crates: connections feed decoded messages into a single
//! `gate` module, blocking work runs on a sticky task pool, and replies are
//! framed back onto each connection's send queue.
//!
//! The binary (`gate`) adds the command line, TOML configuration, logging and
//! signal handling around [`Gate`].

pub mod cli;
pub mod config;
pub mod gate;
pub mod logging;
pub mod protocol;
pub mod signals;

pub use config::{AppConfig, ConfigError};
pub use gate::{Gate, GateError, GateState};
