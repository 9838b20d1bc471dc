//! # Blend Wire Format
//!
//! One envelope per codec value: `List[Uint(conn), Demux]`, where `Demux` is a variant:
//!
//! - `Payload(List[Uint(seq), Bytes(payload)])`
//! - `Abort(AbortReason)`, with `AbortReason` one of `Closed(Unit)`, `Gone(Unit)`,
//!   `Off(Unit)` or `Protocol(String)`.

use telepack::Decoder;
use telepack::Encoder;
use telepack::Error;
use telepack::Pack;
use telepack::Result;
use telepack::Unpack;

use crate::blend::AbortReason;
use crate::blend::ConnId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub(crate) conn: ConnId,
    pub(crate) demux: Demux,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Demux {
    /// `seq` counts the connection's payloads, from zero.
    Payload { seq: u64, payload: Vec<u8> },
    Abort(AbortReason),
}

/// Reads the next list item, which must exist, as exactly one `T`.
fn item<T: Unpack>(items: &mut telepack::ListIter<'_>) -> Result<T> {
    let mut dec = items.next()?.ok_or(Error::UnexpectedEnd)?;
    let value = T::unpack(&mut dec)?;
    dec.finish()?;
    Ok(value)
}

fn end_of_list(items: &mut telepack::ListIter<'_>) -> Result<()> {
    match items.next()? {
        Some(extra) => Err(Error::TrailingBytes(extra.remaining())),
        None => Ok(()),
    }
}

impl Pack for Envelope {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        enc.list_begin()?;
        enc.uint(self.conn.0)?;
        self.demux.pack(enc)?;
        enc.list_end()
    }
}

impl Unpack for Envelope {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut items = dec.list()?;
        let conn = ConnId(item::<u64>(&mut items)?);
        let demux = item::<Demux>(&mut items)?;
        end_of_list(&mut items)?;
        Ok(Self { conn, demux })
    }
}

impl Pack for Demux {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Payload { seq, payload } => {
                enc.variant_begin("Payload")?;
                enc.list_begin()?;
                enc.uint(*seq)?;
                enc.bytes(payload)?;
                enc.list_end()?;
            }
            Self::Abort(reason) => {
                enc.variant_begin("Abort")?;
                reason.pack(enc)?;
            }
        }
        enc.variant_end()
    }
}

impl Unpack for Demux {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        let (name, mut body) = dec.variant()?;
        let demux = match name {
            "Payload" => {
                let mut items = body.list()?;
                let seq = item::<u64>(&mut items)?;
                let payload = item::<Vec<u8>>(&mut items)?;
                end_of_list(&mut items)?;
                Self::Payload { seq, payload }
            }
            "Abort" => Self::Abort(AbortReason::unpack(&mut body)?),
            other => return Err(Error::UnknownVariant(other.to_owned())),
        };
        body.finish()?;
        Ok(demux)
    }
}

impl Pack for AbortReason {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Closed => { enc.variant_begin("Closed")?; enc.unit()?; }
            Self::Gone => { enc.variant_begin("Gone")?; enc.unit()?; }
            Self::Off => { enc.variant_begin("Off")?; enc.unit()?; }
            Self::Protocol(msg) => { enc.variant_begin("Protocol")?; enc.str(msg)?; }
        }
        enc.variant_end()
    }
}

impl Unpack for AbortReason {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        let (name, mut body) = dec.variant()?;
        let reason = match name {
            "Closed" => { body.unit()?; Self::Closed }
            "Gone" => { body.unit()?; Self::Gone }
            "Off" => { body.unit()?; Self::Off }
            "Protocol" => Self::Protocol(body.str()?.to_owned()),
            other => return Err(Error::UnknownVariant(other.to_owned())),
        };
        body.finish()?;
        Ok(reason)
    }
}
