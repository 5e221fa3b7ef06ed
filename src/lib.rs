//! forward-relay: a collector and load generator for the forward protocol.
//!
//! - [`server`]: TCP listener that decodes frames and hands entries to a [`sink`]
//! - [`bench`]: concurrent load generator speaking the same protocol
//! - [`protocols::forward`]: frame codec and connection handler

pub mod bench;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocols;
pub mod server;
pub mod sink;

pub use error::{BenchError, ConfigError, ProtocolError, ServerError};
pub use server::{ForwardServer, ProtocolServer, Step};
