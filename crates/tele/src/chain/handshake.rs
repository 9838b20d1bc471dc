//! # Handshake Wire Format
//!
//! - Dial: `varint(chain id) ++ varint(attempt seq)`
//! - Welcome: one byte, a [`RejectCode`] (`Ok` admits the link)

use telepack::varint;

/// The accepter's verdict on a dial.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Ok = 0,
    Malformed = 1,
    ZeroSeq = 2,
    Duplicate = 3,
    ClosedChain = 4,
}

impl RejectCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ok),
            1 => Some(Self::Malformed),
            2 => Some(Self::ZeroSeq),
            3 => Some(Self::Duplicate),
            4 => Some(Self::ClosedChain),
            _ => None,
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Malformed => "malformed dial",
            Self::ZeroSeq => "zero attempt number",
            Self::Duplicate => "duplicate or stale attempt",
            Self::ClosedChain => "chain closed",
        };
        f.write_str(s)
    }
}

pub fn encode_dial(id: u64, seq: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 * varint::MAX_LEN);
    varint::put_uvarint(&mut buf, id);
    varint::put_uvarint(&mut buf, seq);
    buf
}

/// Returns `(chain id, attempt seq)`, or `None` if the message is not exactly two varints.
pub fn decode_dial(buf: &[u8]) -> Option<(u64, u64)> {
    let (id, n) = varint::read_uvarint(buf).ok()?;
    let (seq, m) = varint::read_uvarint(&buf[n..]).ok()?;
    (n + m == buf.len()).then_some((id, seq))
}

pub fn encode_welcome(code: RejectCode) -> [u8; 1] {
    [code as u8]
}

pub fn decode_welcome(buf: &[u8]) -> Option<RejectCode> {
    match buf {
        [b] => RejectCode::from_u8(*b),
        _ => None,
    }
}
