//! # Tele
//!
//! A reconnecting, reliable, multiplexed message transport, built as four stacked layers:
//!
//! - [`chain`]: one logical connection that survives any number of carrier redials and
//!   reports each replacement of the physical link as a *stitch*.
//! - [`faithful`]: exactly-once, in-order delivery of opaque chunks over a chain, using
//!   sequence numbers, a bounded retransmission buffer and SYNC/ACK control messages.
//! - [`codec`]: moves whole values over a faithful connection.
//! - [`blend`]: many independent logical connections multiplexed over one codec connection.
//!
//! The raw point-to-point links underneath are supplied by a [`carrier::Carrier`].
//!
//! ## Failure Model
//!
//! Carrier faults are transient and absorbed by `chain`. Permanent rejections and protocol
//! violations terminate the connection, and each layer converts the terminal error of the
//! layer below into its own. Applications only ever observe data, end-of-stream, or a
//! permanently broken connection.

pub mod blend;
pub mod carrier;
pub mod chain;
pub mod codec;
pub mod config;
pub mod faithful;
pub mod signal;

pub use config::Config;
