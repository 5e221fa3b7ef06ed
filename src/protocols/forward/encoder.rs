//! Forward protocol frame encoder.
//!
//! Each function appends one complete frame to the output buffer, so frames
//! can be written back to back and sent in a single write.

use super::value::Record;
use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use serde::ser::{Serialize, Serializer};

/// Borrowed byte slice serialized as MessagePack bin.
struct Bin<'a>(&'a [u8]);

impl Serialize for Bin<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

/// Append a Message frame: `[tag, timestamp, data]`.
pub fn encode_single(
    buf: &mut BytesMut,
    tag: &str,
    timestamp: u64,
    data: &Record,
) -> Result<(), ProtocolError> {
    rmp_serde::encode::write(&mut buf.writer(), &(tag, timestamp, data))?;
    Ok(())
}

/// Append a Forward frame: `[tag, [[timestamp, data], ...]]`.
pub fn encode_batch(
    buf: &mut BytesMut,
    tag: &str,
    records: &[(u64, Record)],
) -> Result<(), ProtocolError> {
    rmp_serde::encode::write(&mut buf.writer(), &(tag, records))?;
    Ok(())
}

/// Append a PackedForward frame: `[tag, bin]` where the blob is the
/// concatenation of `[timestamp, data]` pairs.
pub fn encode_packed(
    buf: &mut BytesMut,
    tag: &str,
    records: &[(u64, Record)],
) -> Result<(), ProtocolError> {
    let mut packed = Vec::new();
    for record in records {
        rmp_serde::encode::write(&mut packed, record)?;
    }
    rmp_serde::encode::write(&mut buf.writer(), &(tag, Bin(&packed)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::forward::parser::{parse, Frame, ParseResult};
    use crate::protocols::forward::value::Value;

    fn template() -> Record {
        let mut r = Record::new();
        r.insert("message".to_string(), Value::from("test"));
        r.insert("seq".to_string(), Value::UInt(3));
        r
    }

    #[test]
    fn test_encode_single_layout() {
        let mut buf = BytesMut::new();
        encode_single(&mut buf, "t", 1, &Record::new()).unwrap();
        // fixarray(3), fixstr "t", positive fixint 1, fixmap(0)
        assert_eq!(&buf[..], &[0x93, 0xa1, b't', 0x01, 0x80]);
    }

    #[test]
    fn test_encode_single_appends() {
        let mut buf = BytesMut::new();
        for ts in 0..3u64 {
            encode_single(&mut buf, "app", ts, &template()).unwrap();
        }

        let mut offset = 0;
        let mut seen = Vec::new();
        while offset < buf.len() {
            match parse(&buf[offset..]) {
                ParseResult::Complete(Frame::Message { timestamp, record, .. }, consumed) => {
                    assert_eq!(record, template());
                    seen.push(timestamp);
                    offset += consumed;
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_encode_batch_decodes_as_forward() {
        let records: Vec<(u64, Record)> = (0..5).map(|i| (100 + i, template())).collect();
        let mut buf = BytesMut::new();
        encode_batch(&mut buf, "bulk", &records).unwrap();

        match parse(&buf) {
            ParseResult::Complete(Frame::Forward { tag, entries }, consumed) => {
                assert_eq!(consumed, buf.len());
                assert_eq!(tag, "bulk");
                assert_eq!(entries, records);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_encode_packed_uses_bin() {
        let records = vec![(7u64, template())];
        let mut buf = BytesMut::new();
        encode_packed(&mut buf, "p", &records).unwrap();

        // fixarray(2), fixstr "p", then a bin8 marker
        assert_eq!(&buf[..3], &[0x92, 0xa1, b'p']);
        assert_eq!(buf[3], 0xc4);

        match parse(&buf) {
            ParseResult::Complete(Frame::PackedForward { entries, .. }, _) => {
                assert_eq!(entries, records);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
