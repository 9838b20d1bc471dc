//! # Retransmission Buffer
//!
//! Holds every written chunk the peer has not acknowledged yet, plus a cursor that
//! streams them to whichever link writer is current.
//!
//! ## Invariants
//! - Units are numbered densely from `acked`; the buffer never holds a unit below it.
//! - `acked <= cursor <= total`.
//! - Application writes block while `capacity` units are held. The end marker is
//!   appended regardless, so it may exceed capacity by one.
//! - Once aborted, every current and future call fails with the abort error.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::Notify;

use crate::faithful::Error;
use crate::faithful::Result;

struct State {
    /// Sequence number of `units[0]`; everything below was acknowledged.
    acked: u64,
    units: VecDeque<Vec<u8>>,
    /// Sequence number of the next unit to hand to the writer.
    cursor: u64,
    capacity: usize,
    closed: bool,
    aborted: Option<Error>,
}

impl State {
    fn total(&self) -> u64 {
        self.acked + self.units.len() as u64
    }

    fn check(&self) -> Result<()> {
        match &self.aborted {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn release_below(&mut self, count: u64) -> Result<()> {
        if count < self.acked || count > self.total() {
            return Err(Error::ProtocolViolation(format!(
                "acknowledged {} outside [{}, {}]",
                count,
                self.acked,
                self.total()
            )));
        }
        while self.acked < count {
            self.units.pop_front();
            self.acked += 1;
        }
        Ok(())
    }
}

pub(crate) struct Buffer {
    state: Mutex<State>,
    changed: Notify,
}

impl Buffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                acked: 0,
                units: VecDeque::new(),
                cursor: 0,
                capacity: capacity.max(1),
                closed: false,
                aborted: None,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends an application chunk, waiting for room. Returns its sequence number.
    pub(crate) async fn write(&self, chunk: Vec<u8>) -> Result<u64> {
        if chunk.is_empty() {
            return Err(Error::EmptyChunk);
        }
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.lock();
                state.check()?;
                if state.closed {
                    return Err(Error::Closed);
                }
                if state.units.len() < state.capacity {
                    let seq = state.total();
                    state.units.push_back(chunk);
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(seq);
                }
            }
            changed.await;
        }
    }

    /// Appends the end marker. Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.check()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.units.push_back(Vec::new());
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Waits for the unit under the cursor and advances past it. Cancel-safe.
    pub(crate) async fn next(&self) -> Result<(u64, Vec<u8>)> {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.lock();
                state.check()?;
                if state.cursor < state.total() {
                    let seq = state.cursor;
                    let unit = state.units[(seq - state.acked) as usize].clone();
                    state.cursor += 1;
                    return Ok((seq, unit));
                }
            }
            changed.await;
        }
    }

    /// SYNC: drops everything below `count` and rewinds the cursor to it.
    pub(crate) fn seek(&self, count: u64) -> Result<()> {
        {
            let mut state = self.lock();
            state.check()?;
            state.release_below(count)?;
            state.cursor = count;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// ACK: drops everything below `count`.
    pub(crate) fn ack(&self, count: u64) -> Result<()> {
        {
            let mut state = self.lock();
            state.check()?;
            state.release_below(count)?;
            state.cursor = state.cursor.max(count);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Fails every current and future call with `err`. The first abort wins.
    pub(crate) fn abort(&self, err: Error) {
        {
            let mut state = self.lock();
            if state.aborted.is_none() {
                state.aborted = Some(err);
            }
        }
        self.changed.notify_waiters();
    }

    /// `true` once closed and the peer has acknowledged the end marker.
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.lock();
        state.closed && state.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_cursor_streams_in_order() {
        let buffer = Buffer::new(4);
        assert_eq!(buffer.write(b"a".to_vec()).await.unwrap(), 0);
        assert_eq!(buffer.write(b"b".to_vec()).await.unwrap(), 1);
        assert_eq!(buffer.next().await.unwrap(), (0, b"a".to_vec()));
        assert_eq!(buffer.next().await.unwrap(), (1, b"b".to_vec()));
        assert!(tokio::time::timeout(SHORT, buffer.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_seek_replays() {
        let buffer = Buffer::new(4);
        for chunk in [b"a", b"b", b"c"] {
            buffer.write(chunk.to_vec()).await.unwrap();
        }
        for _ in 0..3 {
            buffer.next().await.unwrap();
        }
        buffer.seek(1).unwrap();
        assert_eq!(buffer.next().await.unwrap(), (1, b"b".to_vec()));
        assert_eq!(buffer.next().await.unwrap(), (2, b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_ack_bounds() {
        let buffer = Buffer::new(4);
        buffer.write(b"a".to_vec()).await.unwrap();
        buffer.write(b"b".to_vec()).await.unwrap();
        assert!(matches!(buffer.ack(3), Err(Error::ProtocolViolation(_))));
        buffer.ack(2).unwrap();
        assert!(matches!(buffer.ack(1), Err(Error::ProtocolViolation(_))));
        buffer.ack(2).unwrap();
        assert!(matches!(buffer.seek(0), Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_until_ack() {
        let buffer = Arc::new(Buffer::new(2));
        buffer.write(b"a".to_vec()).await.unwrap();
        buffer.write(b"b".to_vec()).await.unwrap();

        let blocked = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.write(b"c".to_vec()).await })
        };
        tokio::time::sleep(SHORT).await;
        assert!(!blocked.is_finished());

        buffer.ack(1).unwrap();
        let seq = tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert_eq!(seq.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_marker_and_drain() {
        let buffer = Buffer::new(1);
        buffer.write(b"a".to_vec()).await.unwrap();
        buffer.close().unwrap();
        buffer.close().unwrap();
        assert!(matches!(buffer.write(b"late".to_vec()).await, Err(Error::Closed)));

        assert_eq!(buffer.next().await.unwrap(), (0, b"a".to_vec()));
        assert_eq!(buffer.next().await.unwrap(), (1, Vec::new()));
        assert!(!buffer.is_drained());
        buffer.ack(2).unwrap();
        assert!(buffer.is_drained());
    }

    #[tokio::test]
    async fn test_empty_chunk_rejected() {
        let buffer = Buffer::new(1);
        assert!(matches!(buffer.write(Vec::new()).await, Err(Error::EmptyChunk)));
    }

    #[tokio::test]
    async fn test_abort_wakes_waiters() {
        let buffer = Arc::new(Buffer::new(1));
        buffer.write(b"a".to_vec()).await.unwrap();
        buffer.next().await.unwrap();

        let writer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.write(b"b".to_vec()).await })
        };
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.next().await })
        };
        tokio::time::sleep(SHORT).await;
        buffer.abort(Error::ProtocolViolation("test".into()));
        buffer.abort(Error::Closed);

        let written = tokio::time::timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        let read = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(written, Err(Error::ProtocolViolation(_))));
        assert!(matches!(read, Err(Error::ProtocolViolation(_))));
        assert!(buffer.close().is_err());
    }
}
