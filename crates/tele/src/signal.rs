//! # Latch
//!
//! A one-way, level-triggered flag used for kill, abort and link retirement.
//! Once fired it stays fired; every current and future waiter is released.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Latch {
    fired: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the latch. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves once the latch has fired. Cancel-safe.
    pub async fn wait(&self) {
        loop {
            // Register before checking so a concurrent `fire` cannot slip between.
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}
