//! Streamed record delivery (EXPORTATION and SEARCHDATA answers)
//!
//! ```text
//! OK;<count>\n  then count × ;SIB;<index>;<len>;<pickled record>
//! ```
//! Records carry no terminator: each one ends where its declared length says,
//! so several may share a socket read and one may span many.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::{finish, put_sized, Frame, FrameBuffer, Reader, ServerMessage, Step};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub index: u64,
    pub data: Vec<u8>,
}

impl Frame for StreamRecord {
    fn encode(&self, out: &mut BytesMut) {
        out.put_slice(b";SIB;");
        out.put_slice(self.index.to_string().as_bytes());
        out.put_u8(b';');
        put_sized(out, &self.data);
    }

    fn decode(buf: &[u8]) -> ProtocolResult<Option<(Self, usize)>> {
        let mut r = Reader::new(buf);
        let step = decode_record(&mut r);
        finish(step, &r)
    }
}

fn decode_record(r: &mut Reader<'_>) -> Step<StreamRecord> {
    r.literal(b";SIB;")?;
    let index = r.number(b';')?;
    let data = r.sized()?.to_vec();
    Ok(StreamRecord { index, data })
}

/// The `OK;<count>` header announcing a stream.
pub fn encode_header(count: usize) -> ServerMessage {
    ServerMessage::Ok(Some(count.to_string()))
}

/// Parse a stream header payload.
pub fn parse_header(payload: Option<&str>) -> ProtocolResult<usize> {
    payload
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| ProtocolError::Framing(format!("bad stream header {payload:?}")))
}

/// Collects a known number of streamed records out of a [`FrameBuffer`].
#[derive(Debug)]
pub struct StreamAssembler {
    expected: usize,
    records: Vec<StreamRecord>,
}

impl StreamAssembler {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            records: Vec::with_capacity(expected.min(1024)),
        }
    }

    /// Take every complete record available. Returns true once all arrived.
    pub fn feed(&mut self, buf: &mut FrameBuffer) -> ProtocolResult<bool> {
        while !self.is_complete() {
            match buf.next_frame::<StreamRecord>()? {
                Some(record) => self.records.push(record),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.records.len() >= self.expected
    }

    pub fn into_records(self) -> Vec<StreamRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(index: u64, size: usize) -> StreamRecord {
        StreamRecord {
            index,
            data: (0..size).map(|i| (i % 251) as u8).collect(),
        }
    }

    #[test]
    fn test_back_to_back_in_one_read() {
        let a = record(1, 40);
        let b = record(9, 3000);
        let mut wire = a.to_bytes();
        wire.extend_from_slice(&b.to_bytes());

        let mut fb = FrameBuffer::new();
        fb.extend(&wire);
        let mut asm = StreamAssembler::new(2);
        assert!(asm.feed(&mut fb).unwrap());
        assert_eq!(asm.into_records(), vec![a, b]);
        assert!(fb.is_empty());
    }

    #[test]
    fn test_header_and_records_share_a_read() {
        let mut wire = encode_header(1).to_bytes();
        wire.extend_from_slice(&record(3, 10).to_bytes());

        let mut fb = FrameBuffer::new();
        fb.extend(&wire);
        let header = fb.next_frame::<ServerMessage>().unwrap();
        let count = match header {
            Some(ServerMessage::Ok(payload)) => parse_header(payload.as_deref()).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        let mut asm = StreamAssembler::new(count);
        assert!(asm.feed(&mut fb).unwrap());
    }

    #[test]
    fn test_empty_stream_is_complete() {
        let mut fb = FrameBuffer::new();
        assert!(StreamAssembler::new(0).feed(&mut fb).unwrap());
    }

    #[test]
    fn test_garbage_is_framing_error() {
        let mut fb = FrameBuffer::new();
        fb.extend(b";SIX;1;1;x");
        assert!(StreamAssembler::new(1).feed(&mut fb).is_err());
        assert!(parse_header(Some("many")).is_err());
        assert!(parse_header(None).is_err());
    }

    proptest! {
        #[test]
        fn split_read_matches_single_read(
            sizes in prop::collection::vec(0usize..2048, 1..4),
            split in any::<prop::sample::Index>(),
        ) {
            let records: Vec<_> = sizes.iter().enumerate().map(|(i, &n)| record(i as u64 + 1, n)).collect();
            let mut wire = BytesMut::new();
            for r in &records {
                r.encode(&mut wire);
            }
            let cut = split.index(wire.len() + 1);

            let mut fb = FrameBuffer::new();
            let mut asm = StreamAssembler::new(records.len());
            fb.extend(&wire[..cut]);
            let done_early = asm.feed(&mut fb).unwrap();
            prop_assert_eq!(done_early, cut == wire.len());
            fb.extend(&wire[cut..]);
            prop_assert!(asm.feed(&mut fb).unwrap());
            prop_assert_eq!(asm.into_records(), records);
        }
    }
}
