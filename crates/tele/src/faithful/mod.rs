//! # Faithful
//!
//! Exactly-once, in-order delivery of opaque chunks over a [`chain`](crate::chain),
//! no matter how many times the link underneath is replaced.
//!
//! Every chunk written is numbered and kept in a bounded retransmission buffer until
//! the peer acknowledges it. The receiver drives recovery: after each stitch it sends
//! a SYNC with the number of chunks it holds, and the sender rewinds to that point.
//! A chunk from beyond a gap triggers the same SYNC.
//!
//! ## Invariants
//! - The application sees chunks densely numbered from zero, without duplicates.
//! - A full buffer blocks writers; nothing is ever dropped to make room.
//! - An acknowledgment outside `[acked, written]` is a protocol violation and fatal.
//! - Close appends an empty end-of-stream chunk, so empty application chunks are refused.
//! - A chunk that would not fit in one carrier frame is refused before it is numbered.

mod buffer;
mod conn;
mod frame;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::carrier::Carrier;
use crate::chain;
use crate::chain::IdSource;
use crate::config::Config;

pub use conn::FaithfulConn;
pub use conn::FaithfulReader;
pub use conn::FaithfulWriter;

/// Errors that occur at the faithful layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The write side was closed, or the connection finished gracefully.
    Closed,
    /// Empty chunks are reserved for the end-of-stream marker.
    EmptyChunk,
    /// The chunk cannot fit in one carrier frame once framed.
    ChunkTooLarge { len: usize, max: usize },
    /// The peer sent something no correct peer would.
    ProtocolViolation(String),
    /// The chain underneath ended.
    Chain(chain::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Faithful connection closed"),
            Self::EmptyChunk => write!(f, "Empty chunks cannot be written"),
            Self::ChunkTooLarge { len, max } => {
                write!(f, "Chunk of {} bytes exceeds the {} byte limit", len, max)
            }
            Self::ProtocolViolation(msg) => write!(f, "Faithful protocol violation: {}", msg),
            Self::Chain(e) => write!(f, "Chain error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<chain::Error> for Error {
    fn from(e: chain::Error) -> Self {
        Self::Chain(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Creates outbound faithful connections.
#[derive(Clone)]
pub struct Dialer {
    chain: chain::Dialer,
}

impl Dialer {
    pub fn new(carrier: Arc<dyn Carrier>, config: Config, ids: Arc<dyn IdSource>) -> Result<Self> {
        Ok(Self { chain: chain::Dialer::new(carrier, config, ids)? })
    }

    /// Returns immediately; see [`chain::Dialer::dial`].
    pub fn dial(&self, addr: &str) -> FaithfulConn {
        FaithfulConn::new(self.chain.dial(addr), self.chain.config())
    }
}

/// Accepts inbound faithful connections.
pub struct Listener {
    chain: chain::Listener,
    config: Config,
}

impl Listener {
    pub async fn bind(carrier: Arc<dyn Carrier>, addr: &str, config: Config) -> Result<Self> {
        let chain = chain::Listener::bind(carrier, addr, config.clone()).await?;
        Ok(Self { chain, config })
    }

    pub async fn accept(&mut self) -> Result<FaithfulConn> {
        let chain = self.chain.accept().await?;
        Ok(FaithfulConn::new(chain, &self.config))
    }

    pub fn addr(&self) -> &str {
        self.chain.addr()
    }

    pub fn close(&self) {
        self.chain.close();
    }
}
