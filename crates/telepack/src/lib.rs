//! # Telepack
//!
//! A small, bounded, schema-agnostic encoding for values moved over tele connections.
//!
//! ## Philosophy
//!
//! - **TLV Architecture**: `[Tag][Length?][Value]` so unknown items can be skipped.
//! - **Compact Integers**: all integers and lengths are LEB128 varints (see [`varint`]).
//! - **Bounded**: the decoder is a zero-copy, bounds-checked view; it never panics on
//!   hostile input.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b]` or `[Tag: 1b][Varint]`
//! - **Blobs**: `[Tag: 1b][Len: varint][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b LE][Body: Len]`
//!
//! Container lengths are fixed-width so the encoder can back-patch them.

pub mod varint;

#[cfg(test)]
mod tests;

/// Telepack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`, or a different tag was expected.
    InvalidTag(u8),
    /// A string blob held invalid UTF-8.
    InvalidUtf8,
    /// Input ended in the middle of a value.
    UnexpectedEnd,
    /// A varint did not fit in 64 bits.
    VarintOverflow,
    /// A decoded integer does not fit the requested width.
    IntegerOverflow(u64),
    /// A blob or container longer than a `u32` length prefix can describe.
    BlobTooLarge(usize),
    /// An `*_end` call that does not close the innermost open container.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// `into_bytes` called while a container is still open.
    ScopeStillOpen,
    /// A variant or option scope must hold exactly one item.
    NotExactlyOne(Scope),
    /// A variant name the decoder does not know.
    UnknownVariant(String),
    /// Bytes remained after a complete top-level value was decoded.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "Invalid tag byte: {:#04x}", b),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "Scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::NotExactlyOne(s) => write!(f, "Scope {:?} must hold exactly one item", s),
            Error::UnknownVariant(name) => write!(f, "Unknown variant: {}", name),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after value", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for telepack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The first byte of every encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Unit = 0x01,
    BoolTrue = 0x02,
    BoolFalse = 0x03,
    /// Unsigned integer, varint body.
    Uint = 0x04,
    OptionNone = 0x05,

    // Blobs (Tag + varint Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers: tag, u32 length, then the nested values.
    List = 0x20,
    OptionSome = 0x30,
    Variant = 0x33,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::Unit),
            0x02 => Some(Tag::BoolTrue),
            0x03 => Some(Tag::BoolFalse),
            0x04 => Some(Tag::Uint),
            0x05 => Some(Tag::OptionNone),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x30 => Some(Tag::OptionSome),
            0x33 => Some(Tag::Variant),
            _ => None,
        }
    }
}

/// Open container kinds on the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    List,
    /// Exactly one item.
    Option,
    /// Exactly one item after the name.
    Variant,
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A state-machine driven encoder that back-patches container lengths.
pub struct Encoder {
    buf: Vec<u8>,
    /// Open containers, innermost last, above a `Scope::Root` sentinel.
    stack: Vec<Frame>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64),
            stack: vec![Frame { start: 0, scope: Scope::Root, count: 0 }],
        }
    }

    /// Consumes the encoder and returns the encoded bytes.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a container was left open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn frame(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn begin_item(&mut self) -> Result<()> {
        let frame = self.frame();
        match frame.scope {
            Scope::Option | Scope::Variant if frame.count >= 1 => Err(Error::NotExactlyOne(frame.scope)),
            _ => {
                frame.count += 1;
                Ok(())
            }
        }
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.begin_item()?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        let frame = self.frame();
        if frame.scope != expected || expected == Scope::Root {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if matches!(frame.scope, Scope::Option | Scope::Variant) && frame.count != 1 {
            return Err(Error::NotExactlyOne(frame.scope));
        }
        let start = frame.start;
        self.stack.pop();

        let body_len = self.buf.len() - start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[start - 4..start].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        if data.len() > u32::MAX as usize {
            return Err(Error::BlobTooLarge(data.len()));
        }
        self.begin_item()?;
        self.buf.push(tag as u8);
        varint::put_uvarint(&mut self.buf, data.len() as u64);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Encodes Unit `()`.
    pub fn unit(&mut self) -> Result<()> {
        self.begin_item()?;
        self.buf.push(Tag::Unit as u8);
        Ok(())
    }

    /// `true` and `false` are distinct tags.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        let tag = if v { Tag::BoolTrue } else { Tag::BoolFalse };
        self.begin_item()?;
        self.buf.push(tag as u8);
        Ok(())
    }

    /// Encodes an unsigned integer as a varint.
    pub fn uint(&mut self, v: u64) -> Result<()> {
        self.begin_item()?;
        self.buf.push(Tag::Uint as u8);
        varint::put_uvarint(&mut self.buf, v);
        Ok(())
    }

    /// A length-prefixed UTF-8 string.
    pub fn str(&mut self, v: &str) -> Result<()> { self.blob(Tag::String, v.as_bytes()) }

    /// A length-prefixed run of opaque bytes.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.blob(Tag::Bytes, v) }

    /// `None` is a bare tag.
    pub fn option_none(&mut self) -> Result<()> {
        self.begin_item()?;
        self.buf.push(Tag::OptionNone as u8);
        Ok(())
    }

    /// Begins an `Option::Some` container. Exactly one item must follow.
    pub fn option_some_begin(&mut self) -> Result<()> { self.begin_scope(Tag::OptionSome, Scope::Option) }

    pub fn option_some_end(&mut self) -> Result<()> { self.end_scope(Scope::Option) }

    /// Items between `list_begin` and `list_end` form one list value.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a named variant. Exactly one payload item must follow.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin_scope(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // The name is metadata, not the payload.
        self.frame().count = 0;
        Ok(())
    }
    /// Ends a variant.
    pub fn variant_end(&mut self) -> Result<()> { self.end_scope(Scope::Variant) }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads values out of a borrowed buffer without copying blobs.
///
/// Container reads return new `Decoder`s restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fails with `Error::TrailingBytes` unless the view is exhausted.
    pub fn finish(&self) -> Result<()> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }

    /// The tag of the next value. Consumes nothing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_varint(&mut self) -> Result<u64> {
        let (v, n) = varint::read_uvarint(self.buf)?;
        self.buf = &self.buf[n..];
        Ok(v)
    }

    fn read_container_len(&mut self) -> Result<usize> {
        let raw = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let tag = self.peek_tag()?;
        if tag != expected {
            return Err(Error::InvalidTag(tag as u8));
        }
        self.buf = &self.buf[1..];
        Ok(())
    }

    fn blob(&mut self, tag: Tag) -> Result<&'a [u8]> {
        self.expect_tag(tag)?;
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| Error::IntegerOverflow(len))?;
        self.read_bytes(len)
    }

    fn container(&mut self, tag: Tag) -> Result<Decoder<'a>> {
        self.expect_tag(tag)?;
        let len = self.read_container_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Steps over the next value, containers included.
    pub fn skip(&mut self) -> Result<()> {
        match self.peek_tag()? {
            Tag::Unit | Tag::BoolTrue | Tag::BoolFalse | Tag::OptionNone => {
                self.buf = &self.buf[1..];
            }
            Tag::Uint => {
                self.buf = &self.buf[1..];
                self.read_varint()?;
            }
            tag @ (Tag::String | Tag::Bytes) => {
                self.blob(tag)?;
            }
            tag @ (Tag::List | Tag::OptionSome | Tag::Variant) => {
                self.container(tag)?;
            }
        }
        Ok(())
    }

    /// Decodes Unit `()`.
    pub fn unit(&mut self) -> Result<()> { self.expect_tag(Tag::Unit) }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.buf = &self.buf[1..]; Ok(true) }
            Tag::BoolFalse => { self.buf = &self.buf[1..]; Ok(false) }
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes an unsigned integer.
    pub fn uint(&mut self) -> Result<u64> {
        self.expect_tag(Tag::Uint)?;
        self.read_varint()
    }

    /// Borrows the next string out of the buffer.
    pub fn str(&mut self) -> Result<&'a str> {
        let bytes = self.blob(Tag::String)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> { self.blob(Tag::Bytes) }

    /// Decodes an Option, returning a decoder over the payload if present.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::OptionNone => {
                self.buf = &self.buf[1..];
                Ok(None)
            }
            Tag::OptionSome => Ok(Some(self.container(Tag::OptionSome)?)),
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes a List into an iterator of item decoders.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.container(Tag::List)? })
    }

    /// Decodes a Variant, returning `(name, payload decoder)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.container(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Iterator over the items of a List.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder for the next item, or `None` when the list is exhausted.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// A value that can be written with an `Encoder`.
pub trait Pack {
    fn pack(&self, enc: &mut Encoder) -> Result<()>;
}

/// A value that can be read back from a `Decoder`.
pub trait Unpack: Sized {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self>;
}

/// Encodes one value into a fresh buffer.
pub fn pack<T: Pack + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    value.pack(&mut enc)?;
    enc.into_bytes()
}

/// Decodes exactly one value from `bytes`.
pub fn unpack<T: Unpack>(bytes: &[u8]) -> Result<T> {
    let mut dec = Decoder::new(bytes);
    let value = T::unpack(&mut dec)?;
    dec.finish()?;
    Ok(value)
}

impl Pack for () {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.unit() }
}

impl Unpack for () {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { dec.unit() }
}

impl Pack for bool {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.bool(*self) }
}

impl Unpack for bool {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { dec.bool() }
}

impl Pack for u64 {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.uint(*self) }
}

impl Unpack for u64 {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { dec.uint() }
}

impl Pack for u32 {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.uint(u64::from(*self)) }
}

impl Unpack for u32 {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        let v = dec.uint()?;
        u32::try_from(v).map_err(|_| Error::IntegerOverflow(v))
    }
}

impl Pack for str {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.str(self) }
}

impl Pack for String {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.str(self) }
}

impl Unpack for String {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { Ok(dec.str()?.to_owned()) }
}

impl Pack for [u8] {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.bytes(self) }
}

impl Pack for Vec<u8> {
    fn pack(&self, enc: &mut Encoder) -> Result<()> { enc.bytes(self) }
}

impl Unpack for Vec<u8> {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> { Ok(dec.bytes()?.to_vec()) }
}

impl<T: Pack> Pack for Option<T> {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            None => enc.option_none(),
            Some(v) => {
                enc.option_some_begin()?;
                v.pack(enc)?;
                enc.option_some_end()
            }
        }
    }
}

impl<T: Unpack> Unpack for Option<T> {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        match dec.option()? {
            None => Ok(None),
            Some(mut inner) => {
                let v = T::unpack(&mut inner)?;
                inner.finish()?;
                Ok(Some(v))
            }
        }
    }
}
