//! # Blend
//!
//! Many independent logical connections multiplexed over one codec connection.
//!
//! Every value on the wire is an envelope naming its [`ConnId`] and carrying either a
//! payload or an abort. The dialing side numbers connections from an ascending
//! counter and creates them by simply writing; the accepting side materialises a
//! connection when it sees payload number zero for an id it has never seen.
//!
//! A single read loop per session demultiplexes envelopes into per-connection
//! queues, so a connection nobody reads never stalls the others.
//!
//! ## Invariants
//! - Only the dial side creates connections; the accept side only responds.
//! - Within one connection payloads are delivered in order, once.
//! - When the session's connection ends, every open connection observes exactly one
//!   terminal error and the accept queue closes.

mod conn;
mod envelope;
mod session;


use crate::codec;

pub use conn::BlendConn;
pub use session::AcceptSession;
pub use session::DialSession;

/// Names one multiplexed connection within a session.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection was aborted, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Closed by its owner. Surfaces as end of stream.
    Closed,
    /// The peer no longer knows the connection.
    Gone,
    /// The peer does not accept new connections.
    Off,
    /// The peer saw something no correct peer would send.
    Protocol(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Gone => write!(f, "gone"),
            Self::Off => write!(f, "not accepting connections"),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

/// Errors that occur at the blend layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The connection was closed locally.
    Closed,
    /// The peer aborted the connection.
    Aborted(AbortReason),
    /// The session's underlying connection ended.
    Session(codec::Error),
    /// A payload could not be encoded or decoded as the requested value, or is too
    /// large to carry.
    Value(codec::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Blend connection closed"),
            Self::Aborted(reason) => write!(f, "Blend connection aborted by peer: {}", reason),
            Self::Session(e) => write!(f, "Blend session ended: {}", e),
            Self::Value(e) => write!(f, "Blend value error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
