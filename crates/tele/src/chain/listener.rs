//! Accept side: demultiplexes inbound links by chain id.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::carrier::Carrier;
use crate::carrier::CarrierListener;
use crate::carrier::Link;
use crate::chain::ChainConn;
use crate::chain::ChainId;
use crate::chain::Error;
use crate::chain::RejectCode;
use crate::chain::Result;
use crate::chain::conn::Shared;
use crate::chain::conn::watch_orphan;
use crate::chain::handshake;
use crate::config::Config;
use crate::signal::Latch;

/// A live accepted chain and the highest attempt number admitted for it.
struct Slot {
    shared: Arc<Shared>,
    last_seq: u64,
}

type Registry = DashMap<ChainId, Slot>;

/// Accepts inbound chains. Dropping it stops accepting; accepted chains live on.
pub struct Listener {
    addr: String,
    accepted: mpsc::UnboundedReceiver<ChainConn>,
    shutdown: Arc<Latch>,
}

impl Listener {
    /// Listens on `addr` and starts the accept loop.
    pub async fn bind(carrier: Arc<dyn Carrier>, addr: &str, config: Config) -> Result<Self> {
        config.validate()?;
        let inner = carrier.listen(addr).await?;
        let addr = inner.addr();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Latch::new());
        tracing::debug!(addr = %addr, "chain listener bound");
        tokio::spawn(accept_loop(inner, Arc::new(DashMap::new()), tx, shutdown.clone(), config));
        Ok(Self { addr, accepted: rx, shutdown })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Waits for the next new logical connection.
    pub async fn accept(&mut self) -> Result<ChainConn> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(Error::Closed),
            conn = self.accepted.recv() => conn.ok_or(Error::Closed),
        }
    }

    /// Stops accepting. Idempotent.
    pub fn close(&self) {
        self.shutdown.fire();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    mut inner: Box<dyn CarrierListener>,
    registry: Arc<Registry>,
    accepted: mpsc::UnboundedSender<ChainConn>,
    shutdown: Arc<Latch>,
    config: Config,
) {
    loop {
        let link = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            r = inner.accept() => r,
        };
        match link {
            Ok(link) => {
                tokio::spawn(admit(link, registry.clone(), accepted.clone(), config.clone()));
            }
            Err(crate::carrier::Error::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "carrier accept failed");
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(config.redial_delay) => {}
                }
            }
        }
    }
    tracing::debug!(addr = %inner.addr(), "chain listener stopped");
}

enum Verdict {
    Open(ChainConn, Arc<Shared>),
    Redial(Arc<Shared>),
    Reject(RejectCode),
}

/// Runs the handshake on one inbound link and hands it to the right chain.
async fn admit(
    mut link: Link,
    registry: Arc<Registry>,
    accepted: mpsc::UnboundedSender<ChainConn>,
    config: Config,
) {
    let dial = match tokio::time::timeout(config.handshake_timeout, link.rx.recv()).await {
        Ok(Ok(Some(dial))) => dial,
        _ => {
            tracing::debug!("inbound link gave no dial message");
            return;
        }
    };

    let (verdict, seq) = match handshake::decode_dial(&dial) {
        None => (Verdict::Reject(RejectCode::Malformed), 0),
        Some((_, 0)) => (Verdict::Reject(RejectCode::ZeroSeq), 0),
        Some((id, seq)) => (judge(&registry, ChainId(id), seq, &config), seq),
    };

    let code = match &verdict {
        Verdict::Reject(code) => *code,
        _ => RejectCode::Ok,
    };
    let welcome = tokio::time::timeout(
        config.handshake_timeout,
        link.tx.send(&handshake::encode_welcome(code)),
    )
    .await;
    let welcomed = matches!(welcome, Ok(Ok(())));

    match verdict {
        Verdict::Reject(code) => {
            tracing::debug!(seq, %code, "rejected inbound link");
        }
        Verdict::Open(conn, shared) => {
            // A first link lost here is recovered by the dialer's next attempt.
            if !welcomed || shared.install(seq, link).await.is_none() {
                tracing::debug!(chain = %shared.id, "first link failed during handshake");
            }
            tracing::debug!(chain = %shared.id, "accepted new chain");
            if accepted.send(conn).is_err() {
                tracing::debug!(chain = %shared.id, "listener closed, dropping new chain");
            }
        }
        Verdict::Redial(shared) => {
            if welcomed {
                tracing::info!(chain = %shared.id, seq, "redial admitted");
                shared.install(seq, link).await;
            }
        }
    }
}

/// Decides what an attempt `seq` for chain `id` means, updating the registry.
fn judge(registry: &Arc<Registry>, id: ChainId, seq: u64, config: &Config) -> Verdict {
    match registry.entry(id) {
        Entry::Occupied(mut entry) => {
            let slot = entry.get_mut();
            if slot.shared.killed.is_fired() {
                Verdict::Reject(RejectCode::ClosedChain)
            } else if seq <= slot.last_seq {
                Verdict::Reject(RejectCode::Duplicate)
            } else {
                slot.last_seq = seq;
                Verdict::Redial(slot.shared.clone())
            }
        }
        Entry::Vacant(entry) if seq == 1 => {
            let (conn, shared) = ChainConn::new(id, config.event_queue);
            entry.insert(Slot { shared: shared.clone(), last_seq: seq });
            tokio::spawn(supervise(shared.clone(), registry.clone(), config.clone()));
            Verdict::Open(conn, shared)
        }
        Entry::Vacant(_) => Verdict::Reject(RejectCode::ClosedChain),
    }
}

/// Watches an accepted chain for orphaning and unregisters it once it dies.
async fn supervise(shared: Arc<Shared>, registry: Arc<Registry>, config: Config) {
    match config.orphan_timeout {
        Some(timeout) => watch_orphan(shared.clone(), timeout).await,
        None => shared.killed.wait().await,
    }
    registry.remove_if(&shared.id, |_, slot| Arc::ptr_eq(&slot.shared, &shared));
}
