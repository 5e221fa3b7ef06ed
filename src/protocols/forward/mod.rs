//! Forward protocol implementation.
//!
//! The wire format used by log forwarders to ship tagged event records:
//! a stream of self-delimiting MessagePack frames, each decoding into one
//! or more entries.
//!
//! ## Frame Shapes
//!
//! ```text
//! Message:        ["app.log", 1000, {"message": "hi"}]
//! Forward:        ["app.log", [[1000, {...}], [1001, {...}]]]
//! PackedForward:  ["app.log", <bin: [1000, {...}][1001, {...}]>]
//! ```
//!
//! Tags may arrive as text or binary strings. Binary strings inside entry
//! data are converted to text before entries leave the handler.

pub mod encoder;
pub mod handler;
pub mod parser;
pub mod value;

pub use encoder::{encode_batch, encode_packed, encode_single};
pub use handler::{Exit, Handler};
pub use parser::{parse, Frame, FrameScanner, ParseResult};
pub use value::{normalize, Entry, Record, Value};
