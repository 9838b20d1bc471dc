//! Session state, the demultiplexing read loop, and the two session handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::blend::AbortReason;
use crate::blend::BlendConn;
use crate::blend::ConnId;
use crate::blend::Error;
use crate::blend::Result;
use crate::blend::conn::ConnState;
use crate::blend::conn::Inbound;
use crate::blend::envelope::Demux;
use crate::blend::envelope::Envelope;
use crate::codec;
use crate::codec::Codec;
use crate::codec::CodecConn;
use crate::codec::CodecReader;
use crate::codec::CodecWriter;
use crate::codec::PackCodec;
use crate::faithful;
use crate::signal::Latch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Dial,
    Accept,
}

struct Entry {
    state: Arc<ConnState>,
    inbox: mpsc::UnboundedSender<Inbound>,
    next_read_seq: u64,
}

struct Table<C: Codec> {
    conns: HashMap<ConnId, Entry>,
    accept: Option<mpsc::UnboundedSender<BlendConn<C>>>,
    /// Set once the session is torn down.
    ended: Option<codec::Error>,
}

impl<C: Codec> Table<C> {
    fn register(&mut self, id: ConnId) -> (Arc<ConnState>, mpsc::UnboundedReceiver<Inbound>) {
        let state = Arc::new(ConnState::new(id));
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns.insert(id, Entry { state: state.clone(), inbox: tx, next_read_seq: 0 });
        (state, rx)
    }

    /// Removes `id` and hands it its terminal event.
    fn abort(&mut self, id: ConnId, reason: AbortReason) {
        if let Some(entry) = self.conns.remove(&id) {
            entry.state.finish(Error::Aborted(reason.clone()));
            let _ = entry.inbox.send(Inbound::Abort(reason));
        }
    }
}

pub(crate) struct Shared<C: Codec> {
    role: Role,
    codec: C,
    /// The single write path; holding it orders payload numbers with the wire.
    writer: tokio::sync::Mutex<CodecWriter<C>>,
    closer: CodecWriter<C>,
    table: Mutex<Table<C>>,
    dead: Latch,
    next_id: AtomicU64,
}

impl<C: Codec> Shared<C> {
    fn start(conn: CodecConn<C>, role: Role, accept: Option<mpsc::UnboundedSender<BlendConn<C>>>) -> Arc<Self> {
        let (reader, writer) = conn.split();
        let shared = Arc::new(Self {
            role,
            codec: writer.codec().clone(),
            closer: writer.clone(),
            writer: tokio::sync::Mutex::new(writer),
            table: Mutex::new(Table { conns: HashMap::new(), accept, ended: None }),
            dead: Latch::new(),
            next_id: AtomicU64::new(0),
        });
        tokio::spawn(read_loop(shared.clone(), reader));
        shared
    }

    fn lock_table(&self) -> MutexGuard<'_, Table<C>> {
        self.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    fn session_error(&self) -> Error {
        let ended = self.lock_table().ended.clone();
        Error::Session(ended.unwrap_or(codec::Error::Faithful(faithful::Error::Closed)))
    }

    pub(crate) async fn send_payload(&self, state: &ConnState, payload: Vec<u8>) -> Result<()> {
        state.check()?;
        let writer = tokio::select! {
            biased;
            _ = self.dead.wait() => return Err(self.session_error()),
            w = self.writer.lock() => w,
        };
        state.check()?;
        // Handed back unless the faithful buffer took the envelope.
        let reserved = state.reserve_write_seq();
        let envelope = Envelope { conn: state.id, demux: Demux::Payload { seq: reserved.seq(), payload } };
        let written = tokio::select! {
            biased;
            _ = self.dead.wait() => Err(self.session_error()),
            r = writer.write(&envelope) => r.map_err(|e| match e {
                codec::Error::Faithful(faithful::Error::ChunkTooLarge { .. }) => Error::Value(e),
                e => Error::Session(e),
            }),
        };
        if written.is_ok() {
            reserved.commit();
        }
        written
    }

    /// Sends an abort in the background; the outcome only matters to the peer.
    pub(crate) fn send_abort(self: &Arc<Self>, conn: ConnId, reason: AbortReason) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move {
            let envelope = Envelope { conn, demux: Demux::Abort(reason) };
            let writer = tokio::select! {
                biased;
                _ = shared.dead.wait() => return,
                w = shared.writer.lock() => w,
            };
            tokio::select! {
                biased;
                _ = shared.dead.wait() => {}
                r = writer.write(&envelope) => {
                    if let Err(e) = r {
                        tracing::debug!(%conn, error = %e, "abort not sent");
                    }
                }
            }
        });
    }

    /// Removes `id` from the table. Returns whether it was still there.
    pub(crate) fn forget(&self, id: ConnId) -> bool {
        self.lock_table().conns.remove(&id).is_some()
    }

    /// Routes one inbound envelope. Returns an abort to send back, if any.
    fn dispatch(self: &Arc<Self>, envelope: Envelope) -> Option<(ConnId, AbortReason)> {
        let Envelope { conn: id, demux } = envelope;
        let mut table = self.lock_table();
        if table.ended.is_some() {
            return None;
        }

        let (seq, payload) = match demux {
            Demux::Abort(reason) => {
                if table.conns.contains_key(&id) {
                    tracing::debug!(conn = %id, %reason, "aborted by peer");
                    table.abort(id, reason);
                }
                return None;
            }
            Demux::Payload { seq, payload } => (seq, payload),
        };

        if let Some(entry) = table.conns.get_mut(&id) {
            if seq < entry.next_read_seq {
                tracing::trace!(conn = %id, seq, "dropping duplicate payload");
                return None;
            }
            if seq > entry.next_read_seq {
                let reason = AbortReason::Protocol(format!(
                    "payload {} when {} was expected",
                    seq, entry.next_read_seq
                ));
                tracing::warn!(conn = %id, %reason, "aborting connection");
                table.abort(id, reason.clone());
                return Some((id, reason));
            }
            entry.next_read_seq += 1;
            let _ = entry.inbox.send(Inbound::Payload(payload));
            return None;
        }

        match self.role {
            Role::Dial if seq == 0 => {
                tracing::warn!(conn = %id, "peer tried to open a connection on a dial session");
                Some((id, AbortReason::Off))
            }
            Role::Dial => {
                tracing::debug!(conn = %id, seq, "payload for a connection closed here");
                Some((id, AbortReason::Gone))
            }
            Role::Accept if seq != 0 => {
                tracing::debug!(conn = %id, seq, "payload for unknown connection");
                Some((id, AbortReason::Gone))
            }
            Role::Accept => {
                let Some(accept) = table.accept.clone() else {
                    return Some((id, AbortReason::Off));
                };
                let (state, inbox) = table.register(id);
                if let Some(entry) = table.conns.get_mut(&id) {
                    entry.next_read_seq = 1;
                    let _ = entry.inbox.send(Inbound::Payload(payload));
                }
                let conn = BlendConn::new(self.clone(), state.clone(), inbox);
                match accept.send(conn) {
                    Ok(()) => {
                        tracing::debug!(conn = %id, "accepted");
                        None
                    }
                    Err(mpsc::error::SendError(conn)) => {
                        // Nobody accepts any more. Finished first, so dropping it is silent.
                        state.finish(Error::Closed);
                        table.conns.remove(&id);
                        table.accept = None;
                        drop(table);
                        drop(conn);
                        Some((id, AbortReason::Off))
                    }
                }
            }
        }
    }

    /// Ends the session: closes the accept queue and the shared writer, and gives every
    /// open connection its terminal error. Idempotent.
    fn teardown(&self, err: codec::Error) {
        let (conns, accept) = {
            let mut table = self.lock_table();
            if table.ended.is_some() {
                return;
            }
            table.ended = Some(err.clone());
            (std::mem::take(&mut table.conns), table.accept.take())
        };
        self.dead.fire();
        drop(accept);

        tracing::debug!(error = %err, open = conns.len(), "blend session ended");
        for (_, entry) in conns {
            entry.state.finish(Error::Session(err.clone()));
            let _ = entry.inbox.send(Inbound::Broken(err.clone()));
        }
        match err {
            codec::Error::Pack(_) => self.closer.kill(),
            _ => {
                let _ = self.closer.close();
            }
        }
    }

    fn shutdown(&self) {
        self.teardown(codec::Error::Faithful(faithful::Error::Closed));
    }

    async fn ended(&self) -> Error {
        self.dead.wait().await;
        self.session_error()
    }
}

async fn read_loop<C: Codec>(shared: Arc<Shared<C>>, mut reader: CodecReader<C>) {
    let err = loop {
        let read = tokio::select! {
            biased;
            _ = shared.dead.wait() => return,
            r = reader.read::<Envelope>() => r,
        };
        match read {
            Ok(Some(envelope)) => {
                if let Some((id, reason)) = shared.dispatch(envelope) {
                    shared.send_abort(id, reason);
                }
            }
            Ok(None) => break codec::Error::Faithful(faithful::Error::Closed),
            Err(e @ codec::Error::Pack(_)) => {
                tracing::warn!(error = %e, "undecodable envelope, ending session");
                break e;
            }
            Err(e) => break e,
        }
    };
    shared.teardown(err);
}

/// The side that opens connections. Dropping it ends the session.
pub struct DialSession<C: Codec = PackCodec> {
    shared: Arc<Shared<C>>,
}

impl<C: Codec> DialSession<C> {
    /// Takes over `conn` and starts the session's read loop.
    pub fn new(conn: CodecConn<C>) -> Self {
        Self { shared: Shared::start(conn, Role::Dial, None) }
    }

    /// Opens a new connection. The peer learns of it with the first write.
    ///
    /// # Errors
    /// Returns `Error::Session` once the session has ended.
    pub fn dial(&self) -> Result<BlendConn<C>> {
        let mut table = self.shared.lock_table();
        if let Some(e) = &table.ended {
            return Err(Error::Session(e.clone()));
        }
        let id = ConnId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (state, inbox) = table.register(id);
        drop(table);
        tracing::debug!(conn = %id, "dialed");
        Ok(BlendConn::new(self.shared.clone(), state, inbox))
    }

    /// Ends the session and every connection on it. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Resolves once the session has ended, with the reason.
    pub async fn closed(&self) -> Error {
        self.shared.ended().await
    }
}

impl<C: Codec> Drop for DialSession<C> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// The side that receives connections. Dropping it ends the session.
pub struct AcceptSession<C: Codec = PackCodec> {
    shared: Arc<Shared<C>>,
    accepted: mpsc::UnboundedReceiver<BlendConn<C>>,
}

impl<C: Codec> AcceptSession<C> {
    /// Takes over `conn` and starts the session's read loop.
    pub fn new(conn: CodecConn<C>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { shared: Shared::start(conn, Role::Accept, Some(tx)), accepted: rx }
    }

    /// Waits for the peer to open a connection. Its first payload is already queued.
    ///
    /// # Errors
    /// Returns `Error::Session` once the session has ended.
    pub async fn accept(&mut self) -> Result<BlendConn<C>> {
        match self.accepted.recv().await {
            Some(conn) => Ok(conn),
            None => Err(self.shared.session_error()),
        }
    }

    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub async fn closed(&self) -> Error {
        self.shared.ended().await
    }
}

impl<C: Codec> Drop for AcceptSession<C> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
