//! # Codec
//!
//! Moves whole values over a faithful connection, one value per chunk.
//!
//! The encoding is pluggable through [`Codec`]; [`PackCodec`] uses telepack, whose
//! values are self-describing and length-delimited.

use telepack::Pack;
use telepack::Unpack;

use crate::chain::ChainId;
use crate::faithful;
use crate::faithful::FaithfulConn;
use crate::faithful::FaithfulReader;
use crate::faithful::FaithfulWriter;

/// Errors that occur at the codec layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Faithful(faithful::Error),
    /// A value could not be encoded, or a chunk did not decode.
    Pack(telepack::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Faithful(e) => write!(f, "Faithful error: {}", e),
            Self::Pack(e) => write!(f, "Codec error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<faithful::Error> for Error {
    fn from(e: faithful::Error) -> Self {
        Self::Faithful(e)
    }
}

impl From<telepack::Error> for Error {
    fn from(e: telepack::Error) -> Self {
        Self::Pack(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Turns values into chunks and back.
///
/// # invariants
/// - `decode(encode(v)) == v` for every value the application sends.
/// - An encoded value is never empty.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Pack + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: Unpack>(&self, bytes: &[u8]) -> Result<T>;
}

/// The default codec: telepack.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackCodec;

impl Codec for PackCodec {
    fn encode<T: Pack + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(telepack::pack(value)?)
    }

    fn decode<T: Unpack>(&self, bytes: &[u8]) -> Result<T> {
        Ok(telepack::unpack(bytes)?)
    }
}

/// A faithful connection that carries values.
pub struct CodecConn<C: Codec = PackCodec> {
    reader: CodecReader<C>,
    writer: CodecWriter<C>,
}

impl<C: Codec> CodecConn<C> {
    pub fn new(conn: FaithfulConn, codec: C) -> Self {
        let (reader, writer) = conn.split();
        Self {
            reader: CodecReader { inner: reader, codec: codec.clone() },
            writer: CodecWriter { inner: writer, codec },
        }
    }

    pub fn id(&self) -> ChainId {
        self.writer.inner.id()
    }

    pub async fn write<T: Pack + ?Sized>(&self, value: &T) -> Result<()> {
        self.writer.write(value).await
    }

    pub async fn read<T: Unpack>(&mut self) -> Result<Option<T>> {
        self.reader.read().await
    }

    pub fn close(&self) -> Result<()> {
        self.writer.close()
    }

    pub fn kill(&self) {
        self.writer.kill();
    }

    pub fn split(self) -> (CodecReader<C>, CodecWriter<C>) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`CodecConn`].
pub struct CodecReader<C: Codec = PackCodec> {
    inner: FaithfulReader,
    codec: C,
}

impl<C: Codec> CodecReader<C> {
    /// Reads the next value, or `Ok(None)` at end of stream.
    ///
    /// A chunk that does not decode as `T` is consumed and reported as `Error::Pack`.
    pub async fn read<T: Unpack>(&mut self) -> Result<Option<T>> {
        match self.inner.read().await? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn id(&self) -> ChainId {
        self.inner.id()
    }
}

/// Sending half of a [`CodecConn`]. Clones share one stream.
#[derive(Clone)]
pub struct CodecWriter<C: Codec = PackCodec> {
    inner: FaithfulWriter,
    codec: C,
}

impl<C: Codec> CodecWriter<C> {
    pub async fn write<T: Pack + ?Sized>(&self, value: &T) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        Ok(self.inner.write(&bytes).await?)
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.inner.close()?)
    }

    pub fn kill(&self) {
        self.inner.kill();
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Resolves once the connection has ended, with the reason.
    pub async fn closed(&self) -> Error {
        Error::Faithful(self.inner.closed().await)
    }
}
