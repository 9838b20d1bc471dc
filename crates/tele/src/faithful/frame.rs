//! # Faithful Wire Format
//!
//! One frame per chain chunk:
//!
//! - `0x00 ++ varint(seq) ++ payload` (CHUNK; an empty payload is the end marker)
//! - `0x01 ++ varint(count)` (SYNC)
//! - `0x02 ++ varint(count)` (ACK)

use telepack::varint;

use crate::faithful::Error;
use crate::faithful::Result;

const KIND_CHUNK: u8 = 0;
const KIND_SYNC: u8 = 1;
const KIND_ACK: u8 = 2;

/// Largest CHUNK header: the kind byte and a full-width sequence number.
pub(crate) const CHUNK_HEADER_LEN_MAX: usize = 1 + varint::MAX_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Chunk { seq: u64, payload: Vec<u8> },
    /// Rewind to `count`: the receiver holds every chunk below it.
    Sync(u64),
    /// The receiver holds every chunk below `count`.
    Ack(u64),
}

impl Frame {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Self::Chunk { seq, payload } => encode_chunk(*seq, payload),
            Self::Sync(count) => encode_count(KIND_SYNC, *count),
            Self::Ack(count) => encode_count(KIND_ACK, *count),
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let Some((&kind, rest)) = buf.split_first() else {
            return Err(Error::ProtocolViolation("empty frame".into()));
        };
        let (n, used) = varint::read_uvarint(rest)
            .map_err(|e| Error::ProtocolViolation(format!("bad frame header: {}", e)))?;
        let rest = &rest[used..];
        match kind {
            KIND_CHUNK => Ok(Self::Chunk { seq: n, payload: rest.to_vec() }),
            KIND_SYNC | KIND_ACK if !rest.is_empty() => Err(Error::ProtocolViolation(format!(
                "{} trailing bytes after control frame",
                rest.len()
            ))),
            KIND_SYNC => Ok(Self::Sync(n)),
            KIND_ACK => Ok(Self::Ack(n)),
            other => Err(Error::ProtocolViolation(format!("unknown frame kind {}", other))),
        }
    }
}

/// Encodes a CHUNK without taking ownership of the payload.
pub(crate) fn encode_chunk(seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN_MAX + payload.len());
    buf.push(KIND_CHUNK);
    varint::put_uvarint(&mut buf, seq);
    buf.extend_from_slice(payload);
    buf
}

fn encode_count(kind: u8, count: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + varint::MAX_LEN);
    buf.push(kind);
    varint::put_uvarint(&mut buf, count);
    buf
}
