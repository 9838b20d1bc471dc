//! Logical chain connection and link installation, shared by both sides.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::carrier::Link;
use crate::carrier::LinkRx;
use crate::carrier::LinkTx;
use crate::chain::ChainId;
use crate::chain::Delivery;
use crate::chain::Error;
use crate::chain::Result;
use crate::chain::Stitch;
use crate::signal::Latch;

/// One physical link as seen by the chain.
pub(crate) struct LinkState {
    pub(crate) seq: u64,
    pub(crate) retired: Latch,
}

pub(crate) enum Event {
    Chunk { seq: u64, chunk: Vec<u8> },
    Stitch(Stitch),
}

/// State shared by a chain's user-facing handles and its background tasks.
pub(crate) struct Shared {
    pub(crate) id: ChainId,
    pub(crate) killed: Latch,
    terminal: Mutex<Option<Error>>,
    current: Mutex<Option<Arc<LinkState>>>,
    /// Woken whenever a new link is installed.
    pub(crate) installed: Notify,
    events: mpsc::Sender<Event>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Shared {
    /// Ends the chain. The first reason given wins; `None` means a local kill.
    pub(crate) fn kill(&self, reason: Option<Error>) {
        {
            let mut terminal = lock(&self.terminal);
            if terminal.is_none() {
                *terminal = Some(reason.unwrap_or(Error::Killed));
            }
        }
        if self.killed.fire() {
            tracing::debug!(chain = %self.id, "chain killed");
        }
        if let Some(link) = lock(&self.current).take() {
            link.retired.fire();
        }
    }

    pub(crate) fn terminal_error(&self) -> Error {
        lock(&self.terminal).clone().unwrap_or(Error::Killed)
    }

    pub(crate) fn current(&self) -> Option<Arc<LinkState>> {
        lock(&self.current).clone()
    }

    pub(crate) fn has_live_link(&self) -> bool {
        self.current().is_some_and(|l| !l.retired.is_fired())
    }

    /// Makes `link` the chain's physical link, retiring the previous one.
    ///
    /// Returns the installed link's state, or `None` if the chain is dead or a link
    /// with a higher attempt number is already installed.
    pub(crate) async fn install(self: &Arc<Self>, seq: u64, link: Link) -> Option<Arc<LinkState>> {
        let state = Arc::new(LinkState { seq, retired: Latch::new() });
        {
            let mut current = lock(&self.current);
            if self.killed.is_fired() {
                return None;
            }
            if let Some(old) = current.as_ref() {
                if old.seq >= seq {
                    tracing::debug!(chain = %self.id, seq, current = old.seq, "refusing stale link");
                    return None;
                }
                old.retired.fire();
            }
            *current = Some(state.clone());
        }
        self.installed.notify_waiters();

        let Link { tx, rx } = link;
        let writer = ChainWriter { seq, tx, link: state.clone(), shared: self.clone() };

        // The stitch must be queued before any chunk of the new link.
        let queued = tokio::select! {
            biased;
            _ = self.killed.wait() => false,
            _ = state.retired.wait() => false,
            r = self.events.send(Event::Stitch(Stitch { seq, writer })) => r.is_ok(),
        };
        if !queued {
            state.retired.fire();
            return None;
        }

        tracing::debug!(chain = %self.id, seq, "link stitched");
        tokio::spawn(pump(self.clone(), state.clone(), rx));
        Some(state)
    }
}

/// Moves chunks from one physical link into the chain's delivery queue until the
/// link fails, is retired, or the chain dies.
async fn pump(shared: Arc<Shared>, link: Arc<LinkState>, mut rx: Box<dyn LinkRx>) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shared.killed.wait() => break,
            _ = link.retired.wait() => break,
            r = rx.recv() => r,
        };
        let chunk = match received {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                tracing::debug!(chain = %shared.id, seq = link.seq, "link closed by peer");
                break;
            }
            Err(e) => {
                tracing::debug!(chain = %shared.id, seq = link.seq, error = %e, "link failed");
                break;
            }
        };
        let delivered = tokio::select! {
            biased;
            _ = shared.killed.wait() => false,
            _ = link.retired.wait() => false,
            r = shared.events.send(Event::Chunk { seq: link.seq, chunk }) => r.is_ok(),
        };
        if !delivered {
            break;
        }
    }
    link.retired.fire();
}

/// Writes to exactly one physical link.
pub struct ChainWriter {
    seq: u64,
    tx: Box<dyn LinkTx>,
    link: Arc<LinkState>,
    shared: Arc<Shared>,
}

impl ChainWriter {
    /// Attempt number of the link this writer is bound to.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Writes one chunk to the bound link.
    ///
    /// Fails with `Error::Superseded` once the link has been replaced or has failed,
    /// and with the chain's terminal error once the chain is dead.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.shared.killed.is_fired() {
            return Err(self.shared.terminal_error());
        }
        if self.link.retired.is_fired() {
            return Err(Error::Superseded);
        }
        let sent = tokio::select! {
            biased;
            _ = self.link.retired.wait() => return Err(Error::Superseded),
            r = self.tx.send(chunk) => r,
        };
        sent.map_err(|e| {
            tracing::debug!(chain = %self.shared.id, seq = self.seq, error = %e, "link write failed");
            self.link.retired.fire();
            Error::Superseded
        })
    }
}

impl std::fmt::Debug for ChainWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainWriter")
            .field("chain", &self.shared.id)
            .field("seq", &self.seq)
            .finish()
    }
}

/// A cloneable handle for killing a chain from anywhere.
#[derive(Clone)]
pub struct ChainHandle {
    shared: Arc<Shared>,
}

impl ChainHandle {
    pub fn id(&self) -> ChainId {
        self.shared.id
    }

    /// Permanently and non-gracefully ends the chain. Idempotent.
    pub fn kill(&self) {
        self.shared.kill(None);
    }

    pub fn is_killed(&self) -> bool {
        self.shared.killed.is_fired()
    }

    /// Resolves once the chain is dead, with the reason it died.
    pub async fn killed(&self) -> Error {
        self.shared.killed.wait().await;
        self.shared.terminal_error()
    }
}

/// A logical connection. Dropping it kills the chain.
pub struct ChainConn {
    shared: Arc<Shared>,
    events: mpsc::Receiver<Event>,
    /// Attempt number of the most recently delivered stitch.
    stitched: u64,
}

impl ChainConn {
    pub(crate) fn new(id: ChainId, queue: usize) -> (Self, Arc<Shared>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let shared = Arc::new(Shared {
            id,
            killed: Latch::new(),
            terminal: Mutex::new(None),
            current: Mutex::new(None),
            installed: Notify::new(),
            events: tx,
        });
        (Self { shared: shared.clone(), events: rx, stitched: 0 }, shared)
    }

    pub fn id(&self) -> ChainId {
        self.shared.id
    }

    pub fn handle(&self) -> ChainHandle {
        ChainHandle { shared: self.shared.clone() }
    }

    /// Permanently and non-gracefully ends the chain. Idempotent.
    pub fn kill(&self) {
        self.shared.kill(None);
    }

    /// Returns the next chunk from the current link, or a stitch when the link was
    /// replaced. Must be called continuously: stitches are only delivered here.
    ///
    /// # Errors
    /// Returns the chain's terminal error once it is dead.
    pub async fn read(&mut self) -> Result<Delivery> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shared.killed.wait() => None,
                ev = self.events.recv() => ev,
            };
            match event {
                Some(Event::Stitch(stitch)) => {
                    self.stitched = stitch.seq;
                    return Ok(Delivery::Stitch(stitch));
                }
                Some(Event::Chunk { seq, chunk }) if seq == self.stitched => {
                    return Ok(Delivery::Chunk(chunk));
                }
                Some(Event::Chunk { seq, .. }) => {
                    tracing::trace!(chain = %self.shared.id, seq, "dropping chunk from replaced link");
                }
                None => return Err(self.shared.terminal_error()),
            }
        }
    }
}

impl Drop for ChainConn {
    fn drop(&mut self) {
        self.shared.kill(None);
    }
}

impl std::fmt::Debug for ChainConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConn").field("id", &self.shared.id).finish()
    }
}

/// Accept side: kills the chain when no link has been installed for `timeout`.
pub(crate) async fn watch_orphan(shared: Arc<Shared>, timeout: Duration) {
    loop {
        if let Some(link) = shared.current() {
            tokio::select! {
                _ = link.retired.wait() => {}
                _ = shared.killed.wait() => return,
            }
        }

        let installed = shared.installed.notified();
        if shared.has_live_link() {
            continue;
        }
        tokio::select! {
            _ = installed => {}
            _ = shared.killed.wait() => return,
            _ = tokio::time::sleep(timeout) => {
                tracing::info!(chain = %shared.id, ?timeout, "dialer did not return, giving up");
                shared.kill(Some(Error::Orphaned));
                return;
            }
        }
    }
}
