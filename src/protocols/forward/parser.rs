//! Forward protocol frame parser.
//!
//! A frame is a MessagePack array `[tag, second, third?]`. The runtime type
//! of `second` picks the shape:
//!
//! ```text
//! Message:        [tag, time:int|float, record:map]
//! Forward:        [tag, [[time, record], ...]]
//! PackedForward:  [tag, bin(<[time, record]> ...)]
//! ```
//!
//! Frames carry no length prefix; the end of a frame is wherever the
//! MessagePack value ends.

use super::value::{Entry, Record, Value};
use crate::error::ProtocolError;
use rmp_serde::decode;
use serde::Deserialize;
use std::io::{self, Cursor};

/// A decoded protocol frame. The shape is decided once, at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A single entry.
    Message {
        tag: String,
        timestamp: u64,
        record: Record,
    },
    /// Entries inlined as an array of `[time, record]` pairs.
    Forward {
        tag: String,
        entries: Vec<(u64, Record)>,
    },
    /// Entries carried in a binary blob of `[time, record]` pairs.
    PackedForward {
        tag: String,
        entries: Vec<(u64, Record)>,
    },
}

/// The four runtime types accepted in the second frame slot.
enum Payload {
    Time(u64),
    FloatTime(f64),
    Entries(Vec<Value>),
    Packed(Vec<u8>),
}

impl Payload {
    fn classify(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::UInt(t) => Ok(Payload::Time(t)),
            Value::Float(t) => Ok(Payload::FloatTime(t)),
            Value::Array(items) => Ok(Payload::Entries(items)),
            Value::Bytes(blob) => Ok(Payload::Packed(blob)),
            other => Err(ProtocolError::malformed(format!(
                "unknown payload type: {}",
                other.kind()
            ))),
        }
    }
}

impl Frame {
    /// Build a frame from an already decoded MessagePack value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let items = match value {
            Value::Array(items) if items.len() == 2 || items.len() == 3 => items,
            Value::Array(items) => {
                return Err(ProtocolError::malformed(format!(
                    "frame has {} elements, expected 2 or 3",
                    items.len()
                )))
            }
            other => {
                return Err(ProtocolError::malformed(format!(
                    "frame is a {}, expected array",
                    other.kind()
                )))
            }
        };

        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(v) => match v.as_bytes() {
                Some(b) => String::from_utf8_lossy(b).into_owned(),
                None => return Err(ProtocolError::malformed("failed to decode tag field")),
            },
            None => return Err(ProtocolError::malformed("missing tag field")),
        };
        let second = items
            .next()
            .ok_or_else(|| ProtocolError::malformed("missing payload field"))?;
        let third = items.next();

        match Payload::classify(second)? {
            Payload::Time(timestamp) => Ok(Frame::Message {
                tag,
                timestamp,
                record: message_record(third)?,
            }),
            Payload::FloatTime(t) => Ok(Frame::Message {
                tag,
                timestamp: t as u64,
                record: message_record(third)?,
            }),
            Payload::Entries(pairs) => Ok(Frame::Forward {
                tag,
                entries: pairs
                    .into_iter()
                    .map(entry_pair)
                    .collect::<Result<_, _>>()?,
            }),
            Payload::Packed(blob) => Ok(Frame::PackedForward {
                tag,
                entries: unpack_entries(&blob)?,
            }),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Frame::Message { tag, .. }
            | Frame::Forward { tag, .. }
            | Frame::PackedForward { tag, .. } => tag,
        }
    }

    /// Number of entries this frame yields.
    pub fn len(&self) -> usize {
        match self {
            Frame::Message { .. } => 1,
            Frame::Forward { entries, .. } | Frame::PackedForward { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into entries sharing the frame's tag, in wire order.
    pub fn into_entries(self) -> Vec<Entry> {
        match self {
            Frame::Message {
                tag,
                timestamp,
                record,
            } => vec![Entry {
                tag,
                timestamp,
                data: record,
            }],
            Frame::Forward { tag, entries } | Frame::PackedForward { tag, entries } => entries
                .into_iter()
                .map(|(timestamp, data)| Entry {
                    tag: tag.clone(),
                    timestamp,
                    data,
                })
                .collect(),
        }
    }
}

fn message_record(third: Option<Value>) -> Result<Record, ProtocolError> {
    match third {
        Some(Value::Map(record)) => Ok(record),
        _ => Err(ProtocolError::malformed("failed to decode data field")),
    }
}

fn entry_pair(value: Value) -> Result<(u64, Record), ProtocolError> {
    let mut pair = match value {
        Value::Array(pair) if pair.len() == 2 => pair.into_iter(),
        _ => return Err(ProtocolError::malformed("entry is not a [time, record] pair")),
    };
    let timestamp = match pair.next() {
        Some(Value::UInt(t)) => t,
        Some(Value::Float(t)) => t as u64,
        _ => return Err(ProtocolError::malformed("failed to decode timestamp field")),
    };
    match pair.next() {
        Some(Value::Map(record)) => Ok((timestamp, record)),
        _ => Err(ProtocolError::malformed("failed to decode data field")),
    }
}

/// Decode the body of a PackedForward frame.
///
/// Accepts either a single array of pairs or a plain concatenation of
/// pairs. An empty blob yields no entries.
fn unpack_entries(blob: &[u8]) -> Result<Vec<(u64, Record)>, ProtocolError> {
    let mut values = Vec::new();
    let mut offset = 0;
    while offset < blob.len() {
        match decode_value(&blob[offset..]) {
            Ok(Some((value, consumed))) => {
                values.push(value);
                offset += consumed;
            }
            Ok(None) => return Err(ProtocolError::malformed("truncated packed entries")),
            Err(e) => return Err(ProtocolError::malformed(format!("packed entries: {e}"))),
        }
    }

    // A lone array whose first element is itself an array is the
    // array-of-pairs layout rather than a single pair.
    let nested = matches!(
        values.as_slice(),
        [Value::Array(items)] if matches!(items.first(), None | Some(Value::Array(_)))
    );
    let pairs = match values.pop() {
        Some(Value::Array(items)) if nested => items,
        Some(last) => {
            values.push(last);
            values
        }
        None => values,
    };

    pairs.into_iter().map(entry_pair).collect()
}

/// Decode a single MessagePack value from the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer ends before the value does.
pub fn decode_value(buffer: &[u8]) -> Result<Option<(Value, usize)>, decode::Error> {
    if buffer.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buffer);
    let decoded = {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        Value::deserialize(&mut de)
    };

    match decoded {
        Ok(value) => Ok(Some((value, cursor.position() as usize))),
        Err(e) if is_truncated(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_truncated(err: &decode::Error) -> bool {
    match err {
        decode::Error::InvalidMarkerRead(e) | decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(ProtocolError),
}

/// Parse one frame from the front of `buffer`.
pub fn parse(buffer: &[u8]) -> ParseResult {
    FrameScanner::new().parse(buffer)
}

/// Resumable check that a buffer holds one complete MessagePack value.
///
/// Walks markers and length prefixes without building values, so bytes
/// already seen are never scanned again while a frame is still arriving.
/// The value tree is decoded once, when the frame is complete.
#[derive(Debug)]
pub struct FrameScanner {
    /// End of the items verified so far.
    offset: usize,
    /// Values still required to finish the outermost one.
    pending: u64,
}

enum Scan {
    Complete(usize),
    Incomplete,
    /// Reserved marker at this offset.
    Invalid(usize),
}

/// Wire layout of one item, keyed by its marker byte.
enum Shape {
    /// Marker plus a fixed number of bytes, all inline.
    Fixed(usize),
    /// Length prefix of `width` bytes, `extra` header bytes, then `length` bytes.
    Blob { width: usize, extra: usize },
    /// Length prefix of `width` bytes, then `length * per_item` nested values.
    Seq { width: usize, per_item: u64 },
    /// Fixed container: marker only, then this many nested values.
    FixSeq(u64),
    Reserved,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            offset: 0,
            pending: 1,
        }
    }

    /// Bytes at the front of the buffer already known to be well formed.
    pub fn scanned(&self) -> usize {
        self.offset
    }

    /// Same as [`parse`], resuming where the previous `Incomplete` stopped.
    ///
    /// Between calls the buffer may only grow at the end. The scanner resets
    /// after any result other than `Incomplete`.
    pub fn parse(&mut self, buffer: &[u8]) -> ParseResult {
        let end = match self.scan(buffer) {
            Scan::Incomplete => return ParseResult::Incomplete,
            Scan::Complete(end) => end,
            Scan::Invalid(at) => {
                *self = Self::new();
                // Let the decoder describe the bad marker
                return match decode_value(&buffer[..=at]) {
                    Err(e) => ParseResult::Error(ProtocolError::Decode(e)),
                    Ok(_) => ParseResult::Error(ProtocolError::malformed(format!(
                        "reserved marker at offset {at}"
                    ))),
                };
            }
        };
        *self = Self::new();

        match decode_value(&buffer[..end]) {
            Ok(Some((value, consumed))) => match Frame::from_value(value) {
                Ok(frame) => ParseResult::Complete(frame, consumed),
                Err(e) => ParseResult::Error(e),
            },
            Ok(None) => ParseResult::Error(ProtocolError::malformed("truncated frame")),
            Err(e) => ParseResult::Error(ProtocolError::Decode(e)),
        }
    }

    fn scan(&mut self, buffer: &[u8]) -> Scan {
        while self.pending > 0 {
            let Some(rest) = buffer.get(self.offset..) else {
                return Scan::Incomplete;
            };
            let Some(&marker) = rest.first() else {
                return Scan::Incomplete;
            };
            let shape = shape(marker);
            if matches!(shape, Shape::Reserved) {
                return Scan::Invalid(self.offset);
            }
            let Some((size, nested)) = item_extent(shape, rest) else {
                return Scan::Incomplete;
            };
            self.offset += size;
            self.pending = (self.pending - 1).saturating_add(nested);
        }
        Scan::Complete(self.offset)
    }
}

fn shape(marker: u8) -> Shape {
    match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Shape::Fixed(0),
        0x80..=0x8f => Shape::FixSeq(2 * u64::from(marker & 0x0f)),
        0x90..=0x9f => Shape::FixSeq(u64::from(marker & 0x0f)),
        0xa0..=0xbf => Shape::Fixed(usize::from(marker & 0x1f)),
        0xc1 => Shape::Reserved,
        0xc4 | 0xd9 => Shape::Blob { width: 1, extra: 0 },
        0xc5 | 0xda => Shape::Blob { width: 2, extra: 0 },
        0xc6 | 0xdb => Shape::Blob { width: 4, extra: 0 },
        0xc7 => Shape::Blob { width: 1, extra: 1 },
        0xc8 => Shape::Blob { width: 2, extra: 1 },
        0xc9 => Shape::Blob { width: 4, extra: 1 },
        0xcc | 0xd0 => Shape::Fixed(1),
        0xcd | 0xd1 => Shape::Fixed(2),
        0xca | 0xce | 0xd2 => Shape::Fixed(4),
        0xcb | 0xcf | 0xd3 => Shape::Fixed(8),
        // fixext 1, 2, 4, 8, 16 (type byte included)
        0xd4 => Shape::Fixed(2),
        0xd5 => Shape::Fixed(3),
        0xd6 => Shape::Fixed(5),
        0xd7 => Shape::Fixed(9),
        0xd8 => Shape::Fixed(17),
        0xdc => Shape::Seq { width: 2, per_item: 1 },
        0xdd => Shape::Seq { width: 4, per_item: 1 },
        0xde => Shape::Seq { width: 2, per_item: 2 },
        0xdf => Shape::Seq { width: 4, per_item: 2 },
    }
}

/// Size of the item at the front of `bytes` and how many values nest in it.
///
/// `None` when the item is not fully buffered. Nested values are not part of
/// the returned size.
fn item_extent(shape: Shape, bytes: &[u8]) -> Option<(usize, u64)> {
    let available = |size: usize| (bytes.len() >= size).then_some((size, 0));
    match shape {
        Shape::Fixed(n) => available(1 + n),
        Shape::FixSeq(nested) => Some((1, nested)),
        Shape::Blob { width, extra } => {
            let length = usize::try_from(length_prefix(bytes, width)?).unwrap_or(usize::MAX);
            available((1 + width + extra).saturating_add(length))
        }
        Shape::Seq { width, per_item } => {
            let length = length_prefix(bytes, width)?;
            Some((1 + width, length * per_item))
        }
        // Rejected by the caller before sizing
        Shape::Reserved => None,
    }
}

/// Big-endian length following the marker byte.
fn length_prefix(bytes: &[u8], width: usize) -> Option<u64> {
    let prefix = bytes.get(1..1 + width)?;
    Some(prefix.iter().fold(0, |n, &b| (n << 8) | u64::from(b)))
}
