//! Shared setup for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tele::Config;
use tele::carrier::Carrier;
use tele::carrier::sieve::Sieve;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(10);

/// Routes `tracing` output through the test harness. Set `RUST_LOG=tele=debug` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast redials and short timers, so fault tests finish quickly.
pub fn fast_config() -> Config {
    Config::default()
        .with_redial(Duration::from_millis(5), Duration::from_millis(10))
        .with_linger(Duration::from_millis(100))
        .with_handshake_timeout(Duration::from_secs(2))
}

pub fn sieve_carrier(sieve: &Sieve) -> Arc<dyn Carrier> {
    Arc::new(sieve.clone())
}
