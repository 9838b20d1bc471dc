//! # Sieve
//!
//! An in-memory carrier with fault injection, for exercising the stack's reconnection
//! paths in tests.
//!
//! Each dial produces a [`pipe`]: two endpoints that hold shared handles to one queue
//! pair and one cut latch. Neither side owns the pipe; either side, or the harness,
//! can cut it. Chunks still queued on a cut pipe are lost, exactly like bytes in
//! flight on a dropped TCP connection.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;

use crate::carrier::Carrier;
use crate::carrier::CarrierListener;
use crate::carrier::Error;
use crate::carrier::Link;
use crate::carrier::LinkRx;
use crate::carrier::LinkTx;
use crate::carrier::Result;
use crate::signal::Latch;

/// Shared state of one pipe.
#[derive(Debug, Default)]
pub struct PipeShared {
    cut: Latch,
}

impl PipeShared {
    /// Cuts the pipe in both directions.
    pub fn cut(&self) {
        self.cut.fire();
    }

    pub fn is_cut(&self) -> bool {
        self.cut.is_fired()
    }
}

/// Creates a connected pair of link endpoints.
pub fn pipe() -> (Link, Link, Arc<PipeShared>) {
    pipe_with_faults(None)
}

fn pipe_with_faults(faults: Option<Arc<Mutex<Faults>>>) -> (Link, Link, Arc<PipeShared>) {
    let shared = Arc::new(PipeShared::default());
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let a = Link {
        tx: Box::new(PipeTx { tx: tx_a, shared: shared.clone(), faults: faults.clone() }),
        rx: Box::new(PipeRx { rx: rx_b, shared: shared.clone() }),
    };
    let b = Link {
        tx: Box::new(PipeTx { tx: tx_b, shared: shared.clone(), faults }),
        rx: Box::new(PipeRx { rx: rx_a, shared: shared.clone() }),
    };
    (a, b, shared)
}

struct PipeTx {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<PipeShared>,
    faults: Option<Arc<Mutex<Faults>>>,
}

#[async_trait::async_trait]
impl LinkTx for PipeTx {
    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        if self.shared.is_cut() {
            return Err(Error::Io("pipe cut".into()));
        }
        if let Some(faults) = &self.faults {
            if lock(faults).roll() {
                tracing::debug!("sieve dropping link");
                self.shared.cut();
                return Err(Error::Io("pipe cut by fault injection".into()));
            }
        }
        self.tx
            .send(chunk.to_vec())
            .map_err(|_| Error::Io("peer hung up".into()))
    }
}

struct PipeRx {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<PipeShared>,
}

#[async_trait::async_trait]
impl LinkRx for PipeRx {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        tokio::select! {
            biased;
            _ = self.shared.cut.wait() => Err(Error::Io("pipe cut".into())),
            chunk = self.rx.recv() => Ok(chunk),
        }
    }
}

/// Seeded random link failures.
struct Faults {
    rng: StdRng,
    probability: f64,
}

impl Faults {
    fn roll(&mut self) -> bool {
        self.probability > 0.0 && self.rng.gen_bool(self.probability)
    }
}

#[derive(Default)]
struct SieveState {
    listeners: HashMap<String, mpsc::UnboundedSender<Link>>,
    down: HashSet<String>,
    gone: HashSet<String>,
    pipes: Vec<(String, Weak<PipeShared>)>,
    dials: u64,
    faults: Option<Arc<Mutex<Faults>>>,
}

/// The in-memory carrier. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct Sieve {
    state: Arc<Mutex<SieveState>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Sieve {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chunk sent afterwards cuts its link with probability `p`, using a
    /// deterministic generator seeded with `seed`.
    pub fn with_link_failures(self, seed: u64, p: f64) -> Self {
        lock(&self.state).faults = Some(Arc::new(Mutex::new(Faults {
            rng: StdRng::seed_from_u64(seed),
            probability: p.clamp(0.0, 1.0),
        })));
        self
    }

    /// Stops random link failures for links created from now on and for live ones.
    pub fn heal(&self) {
        if let Some(faults) = &lock(&self.state).faults {
            lock(faults).probability = 0.0;
        }
    }

    /// Cuts every live link. Dials keep working.
    pub fn cut_all(&self) -> usize {
        let pipes = std::mem::take(&mut lock(&self.state).pipes);
        let mut cut = 0;
        for (_, pipe) in pipes {
            if let Some(pipe) = pipe.upgrade() {
                if !pipe.is_cut() {
                    pipe.cut();
                    cut += 1;
                }
            }
        }
        cut
    }

    /// While down, dials to `addr` fail transiently.
    pub fn set_down(&self, addr: &str, down: bool) {
        let mut state = lock(&self.state);
        if down {
            state.down.insert(addr.to_owned());
        } else {
            state.down.remove(addr);
        }
    }

    /// Permanently kills `addr`: live links are cut, further dials return `Error::Gone`.
    pub fn kill(&self, addr: &str) {
        let pipes = {
            let mut state = lock(&self.state);
            state.gone.insert(addr.to_owned());
            state.listeners.remove(addr);
            let (doomed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pipes)
                .into_iter()
                .partition(|(a, _)| a == addr);
            state.pipes = kept;
            doomed
        };
        for (_, pipe) in pipes {
            if let Some(pipe) = pipe.upgrade() {
                pipe.cut();
            }
        }
    }

    /// Number of dial attempts made so far.
    pub fn dials(&self) -> u64 {
        lock(&self.state).dials
    }
}

#[async_trait::async_trait]
impl Carrier for Sieve {
    async fn dial(&self, addr: &str) -> Result<Link> {
        let mut state = lock(&self.state);
        state.dials += 1;
        if state.gone.contains(addr) {
            return Err(Error::Gone(addr.to_owned()));
        }
        if state.down.contains(addr) {
            return Err(Error::Io(format!("{} unreachable", addr)));
        }
        let Some(accept) = state.listeners.get(addr).cloned() else {
            return Err(Error::Io(format!("{} refused", addr)));
        };

        let (near, far, shared) = pipe_with_faults(state.faults.clone());
        if accept.send(far).is_err() {
            state.listeners.remove(addr);
            return Err(Error::Io(format!("{} refused", addr)));
        }
        state.pipes.retain(|(_, p)| p.strong_count() > 0);
        state.pipes.push((addr.to_owned(), Arc::downgrade(&shared)));
        Ok(near)
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn CarrierListener>> {
        let mut state = lock(&self.state);
        if state.listeners.get(addr).is_some_and(|l| !l.is_closed()) {
            return Err(Error::Io(format!("{} already in use", addr)));
        }
        state.gone.remove(addr);
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(addr.to_owned(), tx);
        Ok(Box::new(SieveListener { addr: addr.to_owned(), rx }))
    }
}

struct SieveListener {
    addr: String,
    rx: mpsc::UnboundedReceiver<Link>,
}

#[async_trait::async_trait]
impl CarrierListener for SieveListener {
    async fn accept(&mut self) -> Result<Link> {
        self.rx.recv().await.ok_or(Error::Closed)
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }
}
