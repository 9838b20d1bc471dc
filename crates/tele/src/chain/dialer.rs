//! Dial side: one background task per chain keeps a link alive until the chain dies.

use std::sync::Arc;

use crate::carrier;
use crate::carrier::Carrier;
use crate::carrier::Link;
use crate::chain::ChainConn;
use crate::chain::Error;
use crate::chain::IdSource;
use crate::chain::RejectCode;
use crate::chain::Result;
use crate::chain::conn::Shared;
use crate::chain::handshake;
use crate::config::Config;

/// Creates outbound chains.
#[derive(Clone)]
pub struct Dialer {
    carrier: Arc<dyn Carrier>,
    config: Config,
    ids: Arc<dyn IdSource>,
}

impl Dialer {
    /// # Errors
    /// Returns `Error::Config` if `config` does not validate.
    pub fn new(carrier: Arc<dyn Carrier>, config: Config, ids: Arc<dyn IdSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self { carrier, config, ids })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a new logical connection to `addr` immediately; dialing happens in the
    /// background. Must be called inside a tokio runtime.
    pub fn dial(&self, addr: &str) -> ChainConn {
        let id = self.ids.next_id();
        let (conn, shared) = ChainConn::new(id, self.config.event_queue);
        tracing::debug!(chain = %id, addr, "dialing");
        tokio::spawn(redial_loop(
            shared,
            self.carrier.clone(),
            addr.to_owned(),
            self.config.clone(),
        ));
        conn
    }
}

enum Attempt {
    Admitted(Link),
    /// The carrier never connected; the attempt number was not consumed.
    Unreached(carrier::Error),
    /// The handshake was sent but did not complete.
    Failed(String),
    Fatal(Error),
}

async fn redial_loop(shared: Arc<Shared>, carrier: Arc<dyn Carrier>, addr: String, config: Config) {
    let mut seq = 0u64;
    let mut admitted = false;
    // `None` before the first dial, then the number of consecutive failures.
    let mut pause: Option<u32> = None;

    loop {
        if let Some(attempt) = pause {
            tokio::select! {
                _ = shared.killed.wait() => return,
                _ = tokio::time::sleep(config.redial_pause(attempt)) => {}
            }
        }

        let outcome = tokio::select! {
            _ = shared.killed.wait() => return,
            o = attempt(&shared, carrier.as_ref(), &addr, seq + 1, &config) => o,
        };

        match outcome {
            Attempt::Admitted(link) => {
                seq += 1;
                admitted = true;
                pause = Some(0);
                let Some(state) = shared.install(seq, link).await else {
                    return;
                };
                tokio::select! {
                    _ = shared.killed.wait() => return,
                    _ = state.retired.wait() => {}
                }
                tracing::info!(chain = %shared.id, seq, addr = %addr, "link lost, redialing");
            }
            Attempt::Unreached(e) => {
                tracing::debug!(chain = %shared.id, addr = %addr, error = %e, "dial failed");
                pause = Some(pause.map_or(1, |n| n + 1));
            }
            Attempt::Failed(reason) => {
                seq += 1;
                tracing::debug!(chain = %shared.id, seq, addr = %addr, reason = %reason, "handshake failed");
                pause = Some(pause.map_or(1, |n| n + 1));
            }
            // The accepter never saw attempt 1, so nothing was lost: start over.
            Attempt::Fatal(Error::Rejected(RejectCode::ClosedChain)) if !admitted => {
                tracing::debug!(chain = %shared.id, seq = seq + 1, "first attempt never arrived, restarting");
                seq = 0;
                pause = Some(pause.map_or(1, |n| n + 1));
            }
            Attempt::Fatal(e) => {
                tracing::warn!(chain = %shared.id, addr = %addr, error = %e, "chain permanently failed");
                shared.kill(Some(e));
                return;
            }
        }
    }
}

async fn attempt(shared: &Shared, carrier: &dyn Carrier, addr: &str, seq: u64, config: &Config) -> Attempt {
    let mut link = match tokio::time::timeout(config.handshake_timeout, carrier.dial(addr)).await {
        Ok(Ok(link)) => link,
        Ok(Err(carrier::Error::Gone(addr))) => return Attempt::Fatal(Error::Gone(addr)),
        Ok(Err(e)) => return Attempt::Unreached(e),
        Err(_) => return Attempt::Unreached(carrier::Error::Io("dial timed out".into())),
    };

    let exchange = async {
        link.tx
            .send(&handshake::encode_dial(shared.id.0, seq))
            .await
            .map_err(|e| e.to_string())?;
        match link.rx.recv().await {
            Ok(Some(welcome)) => Ok(welcome),
            Ok(None) => Err("closed before welcome".to_owned()),
            Err(e) => Err(e.to_string()),
        }
    };
    let welcome = match tokio::time::timeout(config.handshake_timeout, exchange).await {
        Ok(Ok(welcome)) => welcome,
        Ok(Err(reason)) => return Attempt::Failed(reason),
        Err(_) => return Attempt::Failed("welcome timed out".into()),
    };

    match handshake::decode_welcome(&welcome) {
        Some(RejectCode::Ok) => Attempt::Admitted(link),
        Some(code) => Attempt::Fatal(Error::Rejected(code)),
        None => Attempt::Fatal(Error::Protocol(format!("bad welcome {:?}", welcome))),
    }
}
