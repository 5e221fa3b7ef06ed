//! Protocol implementations.
//!
//! Each protocol has a parser, an encoder for clients, and a connection
//! handler used by the server.
//!
//! - `forward`: the forward log-shipping protocol

pub mod forward;
