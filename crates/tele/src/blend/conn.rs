use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use telepack::Pack;
use telepack::Unpack;
use tokio::sync::mpsc;

use crate::blend::AbortReason;
use crate::blend::ConnId;
use crate::blend::Error;
use crate::blend::Result;
use crate::blend::session::Shared;
use crate::codec;
use crate::codec::Codec;
use crate::codec::PackCodec;

/// What the session's read loop hands a connection.
pub(crate) enum Inbound {
    Payload(Vec<u8>),
    Abort(AbortReason),
    Broken(codec::Error),
}

/// Per-connection state shared with the session table.
pub(crate) struct ConnState {
    pub(crate) id: ConnId,
    /// Only advanced under the session's writer lock.
    next_write_seq: AtomicU64,
    terminal: Mutex<Option<Error>>,
}

impl ConnState {
    pub(crate) fn new(id: ConnId) -> Self {
        Self { id, next_write_seq: AtomicU64::new(0), terminal: Mutex::new(None) }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Error>> {
        self.terminal.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Ends the connection. Returns `true` only for the call that ended it.
    pub(crate) fn finish(&self, err: Error) -> bool {
        let mut terminal = self.lock();
        if terminal.is_some() {
            return false;
        }
        *terminal = Some(err);
        true
    }

    pub(crate) fn check(&self) -> Result<()> {
        match &*self.lock() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn terminal(&self) -> Error {
        self.lock().clone().unwrap_or(Error::Closed)
    }

    /// Takes the next payload number. Only call under the session's writer lock.
    pub(crate) fn reserve_write_seq(&self) -> WriteSeq<'_> {
        let seq = self.next_write_seq.fetch_add(1, Ordering::Relaxed);
        WriteSeq { state: self, seq, committed: false }
    }
}

/// A payload number held by one in-flight write. Dropping it uncommitted gives the
/// number back, so a cancelled or failed write leaves no gap.
pub(crate) struct WriteSeq<'a> {
    state: &'a ConnState,
    seq: u64,
    committed: bool,
}

impl WriteSeq<'_> {
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for WriteSeq<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.state.next_write_seq.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// One multiplexed connection. Dropping it closes it.
pub struct BlendConn<C: Codec = PackCodec> {
    session: Arc<Shared<C>>,
    state: Arc<ConnState>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    ended: bool,
}

impl<C: Codec> BlendConn<C> {
    pub(crate) fn new(session: Arc<Shared<C>>, state: Arc<ConnState>, inbox: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self { session, state, inbox, ended: false }
    }

    pub fn id(&self) -> ConnId {
        self.state.id
    }

    /// Sends one payload. Waits only for the session's shared write path.
    ///
    /// # Errors
    /// - `Error::Closed` after [`close`](Self::close).
    /// - `Error::Aborted` once the peer aborted or closed the connection.
    /// - `Error::Session` once the session ended.
    /// - `Error::Value` for a payload too large for one carrier frame.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        self.session.send_payload(&self.state, payload.to_vec()).await
    }

    /// Returns the next payload, or `Ok(None)` once the peer closed the connection.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.ended {
            return Ok(None);
        }
        match self.inbox.recv().await {
            Some(Inbound::Payload(payload)) => Ok(Some(payload)),
            Some(Inbound::Abort(AbortReason::Closed)) => {
                self.ended = true;
                Ok(None)
            }
            Some(Inbound::Abort(reason)) => Err(Error::Aborted(reason)),
            Some(Inbound::Broken(e)) => Err(Error::Session(e)),
            None => Err(self.state.terminal()),
        }
    }

    /// Encodes `value` with the session's codec and sends it.
    pub async fn write_value<T: Pack + ?Sized>(&self, value: &T) -> Result<()> {
        let bytes = self.session.codec().encode(value).map_err(Error::Value)?;
        self.write(&bytes).await
    }

    pub async fn read_value<T: Unpack>(&mut self) -> Result<Option<T>> {
        match self.read().await? {
            Some(bytes) => Ok(Some(self.session.codec().decode(&bytes).map_err(Error::Value)?)),
            None => Ok(None),
        }
    }

    /// Closes the connection in both directions and tells the peer. Idempotent.
    pub fn close(&self) {
        if !self.state.finish(Error::Closed) {
            return;
        }
        if self.session.forget(self.state.id) {
            tracing::debug!(conn = %self.state.id, "closing");
            self.session.send_abort(self.state.id, AbortReason::Closed);
        }
    }
}

impl<C: Codec> Drop for BlendConn<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: Codec> std::fmt::Debug for BlendConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlendConn").field("id", &self.state.id).finish()
    }
}
