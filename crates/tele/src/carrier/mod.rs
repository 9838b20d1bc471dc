//! # Carrier Abstraction
//!
//! The raw point-to-point links the stack is built on.
//!
//! ## Philosophy
//!
//! - **Chunk-Oriented**: a carrier moves whole opaque chunks. Framing, if the medium
//!   needs any, is the carrier's business.
//! - **Reliable Per Link**: within one physical link chunks arrive in order and intact.
//!   A link can die at any moment; everything above treats that as transient.
//! - **Split Halves**: a [`Link`] is handed out as an owned sender and an owned receiver
//!   so one task can read while another writes, without a shared lock.

pub mod sieve;
pub mod tcp;

/// Errors that occur at the carrier layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transient I/O failure: refused, reset, cut. Worth redialing.
    Io(String),
    /// The remote is permanently gone. Never redial.
    Gone(String),
    /// The local object was closed.
    Closed,
    /// A chunk exceeded the carrier's frame limit.
    FrameTooLarge(usize),
}

impl Error {
    /// `true` for the distinguished "remote permanently gone" dial error.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "Carrier I/O error: {}", msg),
            Self::Gone(addr) => write!(f, "Remote permanently gone: {}", addr),
            Self::Closed => write!(f, "Carrier closed"),
            Self::FrameTooLarge(n) => write!(f, "Frame of {} bytes exceeds carrier limit", n),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sending half of a physical link.
#[async_trait::async_trait]
pub trait LinkTx: Send + 'static {
    /// Sends one chunk. Dropping the sender closes the write direction.
    async fn send(&mut self, chunk: &[u8]) -> Result<()>;
}

/// Receiving half of a physical link.
#[async_trait::async_trait]
pub trait LinkRx: Send + 'static {
    /// Receives the next chunk, or `Ok(None)` when the peer closed the link.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// One physical link, already split.
pub struct Link {
    pub tx: Box<dyn LinkTx>,
    pub rx: Box<dyn LinkRx>,
}

/// Accepts inbound physical links on one address.
#[async_trait::async_trait]
pub trait CarrierListener: Send + 'static {
    async fn accept(&mut self) -> Result<Link>;

    /// The address peers should dial.
    fn addr(&self) -> String;
}

/// A medium that can dial and listen.
///
/// This trait is object-safe (`Arc<dyn Carrier>`).
#[async_trait::async_trait]
pub trait Carrier: Send + Sync + 'static {
    /// Dials `addr`.
    ///
    /// # invariants
    /// - Returns `Error::Gone` only when redialing can never succeed.
    /// - Every other failure is transient.
    async fn dial(&self, addr: &str) -> Result<Link>;

    async fn listen(&self, addr: &str) -> Result<Box<dyn CarrierListener>>;
}
