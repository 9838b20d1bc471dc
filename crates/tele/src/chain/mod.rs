//! # Chain
//!
//! A logical connection that outlives any number of physical carrier links.
//!
//! The dialer names each logical connection with a [`ChainId`] and numbers every
//! handshake it performs for it. The accepter demultiplexes inbound links by id and
//! only honours strictly increasing attempt numbers, so a stale or duplicate redial can
//! never displace a newer link.
//!
//! Readers see a stream of [`Delivery`] values: chunks from the current link, and a
//! [`Stitch`] whenever the link underneath was replaced. A stitch carries the only
//! [`ChainWriter`] that can write to the new link; writers of replaced links fail
//! permanently.
//!
//! ## Invariants
//! - Chunks that arrive on a link after it was replaced are never delivered.
//! - Carrier faults never surface; only `kill`, a permanent rejection, a permanently
//!   gone remote or an orphan timeout end a chain.

mod conn;
mod dialer;
pub mod handshake;
mod listener;

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::carrier;
use crate::config::InvalidConfig;

pub use conn::ChainConn;
pub use conn::ChainHandle;
pub use conn::ChainWriter;
pub use dialer::Dialer;
pub use handshake::RejectCode;
pub use listener::Listener;

/// Names one logical connection across all its physical links.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ChainId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain-{:016x}", self.0)
    }
}

/// Source of fresh chain identifiers. Never yields `ChainId(0)`.
pub trait IdSource: Send + Sync + 'static {
    fn next_id(&self) -> ChainId;
}

/// Random identifiers.
pub struct RandomIds {
    rng: Mutex<StdRng>,
}

impl RandomIds {
    pub fn new() -> Self {
        Self { rng: Mutex::new(StdRng::from_entropy()) }
    }

    /// A reproducible sequence of identifiers.
    pub fn seeded(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn next_id(&self) -> ChainId {
        let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            let id = rng.r#gen::<u64>();
            if id != 0 {
                return ChainId(id);
            }
        }
    }
}

/// Identifiers `start, start + 1, ...`, for deterministic tests.
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(start: u64) -> Self {
        Self { next: AtomicU64::new(start.max(1)) }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> ChainId {
        ChainId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Errors that end a chain, or a single writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The chain was killed locally.
    Killed,
    /// The accepter refused a handshake. Permanent.
    Rejected(RejectCode),
    /// The carrier reported the remote as permanently gone.
    Gone(String),
    /// Accept side only: the dialer did not come back in time.
    Orphaned,
    /// This writer's link has been replaced; take the writer from the next stitch.
    Superseded,
    /// The peer spoke something other than the handshake protocol.
    Protocol(String),
    /// The listener was closed.
    Closed,
    /// Binding the carrier listener failed.
    Carrier(carrier::Error),
    /// The configuration cannot be run with.
    Config(InvalidConfig),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Killed => write!(f, "Chain killed"),
            Self::Rejected(code) => write!(f, "Chain rejected by peer: {}", code),
            Self::Gone(addr) => write!(f, "Chain remote permanently gone: {}", addr),
            Self::Orphaned => write!(f, "Chain orphaned: dialer did not return"),
            Self::Superseded => write!(f, "Link superseded"),
            Self::Protocol(msg) => write!(f, "Chain protocol violation: {}", msg),
            Self::Closed => write!(f, "Chain listener closed"),
            Self::Carrier(e) => write!(f, "Carrier error: {}", e),
            Self::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<carrier::Error> for Error {
    fn from(e: carrier::Error) -> Self {
        Self::Carrier(e)
    }
}

impl From<InvalidConfig> for Error {
    fn from(e: InvalidConfig) -> Self {
        Self::Config(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The physical link under a chain was replaced.
pub struct Stitch {
    /// Attempt number of the new link.
    pub seq: u64,
    /// The only writer bound to the new link.
    pub writer: ChainWriter,
}

impl std::fmt::Debug for Stitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stitch").field("seq", &self.seq).finish()
    }
}

/// One unit read from a chain.
#[derive(Debug)]
pub enum Delivery {
    Chunk(Vec<u8>),
    Stitch(Stitch),
}
