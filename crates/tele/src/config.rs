//! # Configuration
//!
//! Every knob of the stack lives in one [`Config`] value that is passed explicitly to
//! dialers and listeners. Values marked *wire* must match between the two ends of a
//! connection; the rest are local policy.

use std::time::Duration;

/// Default values, with units in the name.
pub mod defaults {
    /// Retransmission buffer capacity in chunks (wire).
    pub const BUFFER_CAPACITY_CHUNKS: usize = 64;
    /// Accepted chunks between two ACKs (wire).
    pub const ACK_FREQUENCY_CHUNKS: u64 = 16;
    /// Pause before redialing a failed carrier link.
    pub const REDIAL_DELAY_MS: u64 = 500;
    /// Upper bound of the random delay added to repeated redials.
    pub const REDIAL_JITTER_MS: u64 = 500;
    /// Time a drained, closed faithful connection keeps serving SYNCs.
    pub const LINGER_MS: u64 = 5 * 1000;
    /// Bound on the chain dial/welcome exchange.
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 10 * 1000;
    /// Time an accept-side chain waits for its dialer to come back.
    pub const ORPHAN_TIMEOUT_MS: u64 = 60 * 1000;
    /// Depth of a chain's delivery queue.
    pub const EVENT_QUEUE_DEPTH: usize = 16;
    /// Largest chunk a length-prefixed carrier accepts (16 MiB, wire).
    pub const FRAME_LENGTH_BYTES_MAX: usize = 16 * 1024 * 1024;
    /// Smallest frame limit accepted; handshakes and chunk headers must fit.
    pub const FRAME_LENGTH_BYTES_MIN: usize = 64;
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfig {
    pub field: &'static str,
    pub reason: &'static str,
}

impl std::fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid config field {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for InvalidConfig {}

#[derive(Debug, Clone)]
pub struct Config {
    /// Retransmission buffer capacity M.
    pub buffer_capacity: usize,
    /// Acknowledgment frequency K.
    pub ack_frequency: u64,
    pub redial_delay: Duration,
    pub redial_jitter: Duration,
    pub linger: Duration,
    pub handshake_timeout: Duration,
    /// `None` keeps an accept-side chain waiting for its dialer forever.
    pub orphan_timeout: Option<Duration>,
    pub event_queue: usize,
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_capacity: defaults::BUFFER_CAPACITY_CHUNKS,
            ack_frequency: defaults::ACK_FREQUENCY_CHUNKS,
            redial_delay: Duration::from_millis(defaults::REDIAL_DELAY_MS),
            redial_jitter: Duration::from_millis(defaults::REDIAL_JITTER_MS),
            linger: Duration::from_millis(defaults::LINGER_MS),
            handshake_timeout: Duration::from_millis(defaults::HANDSHAKE_TIMEOUT_MS),
            orphan_timeout: Some(Duration::from_millis(defaults::ORPHAN_TIMEOUT_MS)),
            event_queue: defaults::EVENT_QUEUE_DEPTH,
            max_frame_len: defaults::FRAME_LENGTH_BYTES_MAX,
        }
    }
}

impl Config {
    pub fn with_buffer_capacity(mut self, chunks: usize) -> Self {
        self.buffer_capacity = chunks;
        self
    }

    pub fn with_ack_frequency(mut self, chunks: u64) -> Self {
        self.ack_frequency = chunks;
        self
    }

    pub fn with_redial(mut self, delay: Duration, jitter: Duration) -> Self {
        self.redial_delay = delay;
        self.redial_jitter = jitter;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_orphan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.orphan_timeout = timeout;
        self
    }

    pub fn with_event_queue(mut self, depth: usize) -> Self {
        self.event_queue = depth;
        self
    }

    pub fn with_max_frame_len(mut self, bytes: usize) -> Self {
        self.max_frame_len = bytes;
        self
    }

    /// Rejects values the stack cannot run with.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.buffer_capacity == 0 {
            return Err(InvalidConfig { field: "buffer_capacity", reason: "must be at least 1" });
        }
        if self.ack_frequency == 0 {
            return Err(InvalidConfig { field: "ack_frequency", reason: "must be at least 1" });
        }
        if self.ack_frequency > self.buffer_capacity as u64 {
            return Err(InvalidConfig {
                field: "ack_frequency",
                reason: "must not exceed buffer_capacity, or a full buffer is never acknowledged",
            });
        }
        if self.event_queue == 0 {
            return Err(InvalidConfig { field: "event_queue", reason: "must be at least 1" });
        }
        if self.max_frame_len < defaults::FRAME_LENGTH_BYTES_MIN {
            return Err(InvalidConfig { field: "max_frame_len", reason: "must be at least 64" });
        }
        if self.max_frame_len > u32::MAX as usize {
            return Err(InvalidConfig { field: "max_frame_len", reason: "must fit a 4 byte length prefix" });
        }
        Ok(())
    }

    /// The pause before the `attempt`-th consecutive redial.
    ///
    /// The first redial after a link failure waits exactly `redial_delay`; later
    /// attempts add up to `redial_jitter` of random delay.
    pub(crate) fn redial_pause(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.redial_jitter.is_zero() {
            return self.redial_delay;
        }
        let jitter_ms = self.redial_jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        let extra = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=jitter_ms);
        self.redial_delay + Duration::from_millis(extra)
    }
}
