//! The faithful connection and its two background tasks.
//!
//! The read loop owns the chain: it delivers accepted chunks, answers stitches with a
//! SYNC, and applies the peer's SYNCs and ACKs to the retransmission buffer. The write
//! loop drains the buffer's cursor into whichever chain writer the read loop handed it
//! last, interleaving the read loop's control frames.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::mpsc;

use crate::chain;
use crate::chain::ChainConn;
use crate::chain::ChainHandle;
use crate::chain::ChainId;
use crate::chain::ChainWriter;
use crate::chain::Delivery;
use crate::config::Config;
use crate::faithful::Error;
use crate::faithful::Result;
use crate::faithful::buffer::Buffer;
use crate::faithful::frame;
use crate::faithful::frame::Frame;
use crate::signal::Latch;

/// Messages from the read loop to the write loop.
enum Ctrl {
    Writer(ChainWriter),
    Frame(Frame),
}

/// `None` is the peer's end marker.
type Inbound = Option<Vec<u8>>;

struct Inner {
    id: ChainId,
    chain: ChainHandle,
    buffer: Buffer,
    dead: Latch,
    terminal: Mutex<Option<Error>>,
    config: Config,
}

impl Inner {
    fn lock_terminal(&self) -> MutexGuard<'_, Option<Error>> {
        self.terminal.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Ends the connection. The first error wins; `Error::Closed` is a graceful end.
    fn fail(&self, err: Error) {
        {
            let mut terminal = self.lock_terminal();
            if terminal.is_none() {
                match &err {
                    Error::Closed => tracing::debug!(chain = %self.id, "faithful connection finished"),
                    Error::ProtocolViolation(msg) => {
                        tracing::warn!(chain = %self.id, %msg, "faithful protocol violation")
                    }
                    e => tracing::debug!(chain = %self.id, error = %e, "faithful connection broken"),
                }
                *terminal = Some(err.clone());
            }
        }
        self.dead.fire();
        self.buffer.abort(err);
        self.chain.kill();
    }

    /// Largest application chunk whose CHUNK frame fits in `max_frame_len`.
    fn max_chunk_len(&self) -> usize {
        self.config.max_frame_len.saturating_sub(frame::CHUNK_HEADER_LEN_MAX)
    }

    fn terminal_error(&self) -> Error {
        self.lock_terminal()
            .clone()
            .unwrap_or(Error::Chain(chain::Error::Killed))
    }

    /// Kills the chain after `linger`, unless something else ends it first.
    fn linger(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.dead.wait() => {}
                _ = tokio::time::sleep(inner.config.linger) => inner.fail(Error::Closed),
            }
        });
    }
}

/// Closes the write side and schedules the kill once every user half is gone.
struct Guard {
    inner: Arc<Inner>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.inner.dead.is_fired() {
            return;
        }
        let _ = self.inner.buffer.close();
        if tokio::runtime::Handle::try_current().is_ok() {
            self.inner.linger();
        } else {
            self.inner.fail(Error::Closed);
        }
    }
}

/// A reliable, ordered, exactly-once stream of chunks in each direction.
///
/// Dropping every half (see [`FaithfulConn::split`]) closes the write side and kills the
/// connection after the configured linger.
pub struct FaithfulConn {
    reader: FaithfulReader,
    writer: FaithfulWriter,
}

impl FaithfulConn {
    /// Takes over `chain` and starts the connection's read and write loops.
    pub fn new(chain: ChainConn, config: &Config) -> Self {
        let inner = Arc::new(Inner {
            id: chain.id(),
            chain: chain.handle(),
            buffer: Buffer::new(config.buffer_capacity),
            dead: Latch::new(),
            terminal: Mutex::new(None),
            config: config.clone(),
        });
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(chain, inner.clone(), ctrl_tx, inbox_tx));
        tokio::spawn(write_loop(inner.clone(), ctrl_rx));

        let guard = Arc::new(Guard { inner: inner.clone() });
        Self {
            reader: FaithfulReader { inner: inner.clone(), inbox: inbox_rx, ended: false, _guard: guard.clone() },
            writer: FaithfulWriter { inner, _guard: guard },
        }
    }

    pub fn id(&self) -> ChainId {
        self.writer.inner.id
    }

    /// See [`FaithfulWriter::write`].
    pub async fn write(&self, chunk: &[u8]) -> Result<()> {
        self.writer.write(chunk).await
    }

    /// See [`FaithfulReader::read`].
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.read().await
    }

    /// See [`FaithfulWriter::close`].
    pub fn close(&self) -> Result<()> {
        self.writer.close()
    }

    /// Ends the connection immediately, discarding anything unacknowledged.
    pub fn kill(&self) {
        self.writer.kill();
    }

    /// See [`FaithfulWriter::closed`].
    pub async fn closed(&self) -> Error {
        self.writer.closed().await
    }

    pub fn split(self) -> (FaithfulReader, FaithfulWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for FaithfulConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaithfulConn").field("id", &self.id()).finish()
    }
}

/// The receiving half.
pub struct FaithfulReader {
    inner: Arc<Inner>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    ended: bool,
    _guard: Arc<Guard>,
}

impl FaithfulReader {
    /// Returns the peer's next chunk, or `Ok(None)` once the peer closed its side.
    ///
    /// # Errors
    /// Returns the connection's terminal error if it broke before the peer's end.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.ended {
            return Ok(None);
        }
        match self.inbox.recv().await {
            Some(Some(chunk)) => Ok(Some(chunk)),
            Some(None) => {
                self.ended = true;
                Ok(None)
            }
            None => Err(self.inner.terminal_error()),
        }
    }

    pub fn id(&self) -> ChainId {
        self.inner.id
    }
}

/// The sending half. Clones share one stream.
#[derive(Clone)]
pub struct FaithfulWriter {
    inner: Arc<Inner>,
    _guard: Arc<Guard>,
}

impl FaithfulWriter {
    /// Queues `chunk` for delivery, waiting while the retransmission buffer is full.
    ///
    /// # Errors
    /// - `Error::EmptyChunk` for an empty chunk.
    /// - `Error::ChunkTooLarge` for a chunk the carrier could never carry. The
    ///   connection stays usable.
    /// - `Error::Closed` after [`close`](Self::close).
    /// - The terminal error once the connection broke.
    pub async fn write(&self, chunk: &[u8]) -> Result<()> {
        let max = self.inner.max_chunk_len();
        if chunk.len() > max {
            return Err(Error::ChunkTooLarge { len: chunk.len(), max });
        }
        self.inner.buffer.write(chunk.to_vec()).await.map(|_| ())
    }

    /// Ends the write side after everything written so far. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.buffer.close()
    }

    pub fn kill(&self) {
        self.inner.fail(Error::Chain(chain::Error::Killed));
    }

    /// Resolves once the connection has ended, with the reason.
    pub async fn closed(&self) -> Error {
        self.inner.dead.wait().await;
        self.inner.terminal_error()
    }

    pub fn id(&self) -> ChainId {
        self.inner.id
    }
}

async fn read_loop(
    mut chain: ChainConn,
    inner: Arc<Inner>,
    ctrl: mpsc::UnboundedSender<Ctrl>,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let ack_frequency = inner.config.ack_frequency.max(1);
    // Sequence number of the next chunk to accept; also the count accepted so far.
    let mut expected = 0u64;
    // The `expected` value a gap-SYNC was already sent for.
    let mut gap_synced: Option<u64> = None;
    let mut unacked = 0u64;
    let mut peer_ended = false;
    let mut lingering = false;

    loop {
        let delivery = match chain.read().await {
            Ok(delivery) => delivery,
            Err(e) => {
                inner.fail(Error::Chain(e));
                break;
            }
        };

        let frame = match delivery {
            Delivery::Stitch(stitch) => {
                tracing::debug!(chain = %inner.id, seq = stitch.seq, expected, "resyncing after stitch");
                let _ = ctrl.send(Ctrl::Writer(stitch.writer));
                let _ = ctrl.send(Ctrl::Frame(Frame::Sync(expected)));
                gap_synced = None;
                unacked = 0;
                continue;
            }
            Delivery::Chunk(raw) => match Frame::decode(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    inner.fail(e);
                    break;
                }
            },
        };

        let applied = match frame {
            Frame::Chunk { seq, .. } if seq < expected => {
                tracing::trace!(chain = %inner.id, seq, expected, "dropping duplicate chunk");
                Ok(())
            }
            Frame::Chunk { seq, .. } if seq > expected => {
                if gap_synced != Some(expected) {
                    tracing::debug!(chain = %inner.id, seq, expected, "gap, requesting resend");
                    gap_synced = Some(expected);
                    let _ = ctrl.send(Ctrl::Frame(Frame::Sync(expected)));
                }
                Ok(())
            }
            Frame::Chunk { .. } if peer_ended => {
                Err(Error::ProtocolViolation(format!("chunk {} after end of stream", expected)))
            }
            Frame::Chunk { payload, .. } => {
                expected += 1;
                unacked += 1;
                let end = payload.is_empty();
                if end || unacked >= ack_frequency {
                    unacked = 0;
                    let _ = ctrl.send(Ctrl::Frame(Frame::Ack(expected)));
                }
                if end {
                    peer_ended = true;
                    let _ = inbox.send(None);
                } else {
                    let _ = inbox.send(Some(payload));
                }
                Ok(())
            }
            Frame::Sync(count) => inner.buffer.seek(count),
            Frame::Ack(count) => inner.buffer.ack(count),
        };
        if let Err(e) = applied {
            inner.fail(e);
            break;
        }

        if !lingering && peer_ended && inner.buffer.is_drained() {
            lingering = true;
            tracing::debug!(chain = %inner.id, linger = ?inner.config.linger, "both sides closed, lingering");
            inner.linger();
        }
    }
}

async fn write_loop(inner: Arc<Inner>, mut ctrl: mpsc::UnboundedReceiver<Ctrl>) {
    let mut writer: Option<ChainWriter> = None;

    loop {
        let bytes = tokio::select! {
            biased;
            _ = inner.dead.wait() => break,
            msg = ctrl.recv() => match msg {
                Some(Ctrl::Writer(w)) => {
                    writer = Some(w);
                    continue;
                }
                Some(Ctrl::Frame(frame)) => frame.encode(),
                None => break,
            },
            unit = inner.buffer.next(), if writer.is_some() => match unit {
                Ok((seq, payload)) => frame::encode_chunk(seq, &payload),
                Err(_) => break,
            },
        };

        // Without a link the frame is lost; the next stitch's SYNC recovers it.
        let Some(w) = writer.as_mut() else {
            continue;
        };
        match w.write(&bytes).await {
            Ok(()) => {}
            Err(chain::Error::Superseded) => writer = None,
            Err(e) => {
                inner.fail(Error::Chain(e));
                break;
            }
        }
    }
}
