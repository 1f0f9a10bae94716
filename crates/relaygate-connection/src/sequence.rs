//! Per-direction sequence tracking
//!
//! Offsets count bytes since the logical tunnel began and never decrease.
//!
//! [`Outbound`] is the producing end of a direction. It keeps every byte the
//! peer has not acknowledged yet in a replay buffer of pool buffers, bounded by
//! a window of `replay_window` buffers. A full window blocks the producer.
//!
//! [`Inbound`] is the consuming end. It tracks `received` (accepted into the
//! local queue) and `delivered` (confirmed written by the final consumer).
//! Acknowledgments always carry `delivered`, so after a resume the peer
//! re-sends from `delivered` and the bytes between `delivered` and `received`
//! arrive a second time; they are discarded as duplicates.
//!
//! Flow control is a receive window in bytes. The receiver announces it in
//! the handshake and the sender never sends past `acked + window`, so
//! accepting a payload never waits on the consumer and acknowledgments keep
//! flowing while the consumer is slow.

use crate::pool::Buffer;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Sequence tracking errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Stream closed")]
    Closed,

    #[error("Stream already finished")]
    Finished,

    #[error("Protocol desync: {0}")]
    Desync(String),
}

/// Next thing the sender owes the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Data { offset: u64, payload: Bytes },
    Fin { length: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OutboundProgress {
    written: u64,
    acked: u64,
    retained: usize,
    eof: bool,
    peer_fin: bool,
    closed: bool,
}

struct ReplayState {
    chunks: VecDeque<Buffer>,
    /// Offset of the first byte of `chunks[0]`
    base: u64,
    written: u64,
    acked: u64,
    eof: bool,
    peer_fin: bool,
    /// Receive window announced by the peer
    peer_window: u64,
    closed: bool,
}

impl ReplayState {
    fn progress(&self) -> OutboundProgress {
        OutboundProgress {
            written: self.written,
            acked: self.acked,
            retained: self.chunks.len(),
            eof: self.eof,
            peer_fin: self.peer_fin,
            closed: self.closed,
        }
    }

    fn release_acked(&mut self) {
        while let Some(front) = self.chunks.front() {
            let end = self.base + front.len() as u64;
            if end > self.acked {
                break;
            }
            self.base = end;
            self.chunks.pop_front();
        }
    }

    fn copy_from(&self, cursor: u64, max: usize) -> Bytes {
        let mut start = self.base;
        for chunk in &self.chunks {
            let end = start + chunk.len() as u64;
            if cursor < end {
                let from = (cursor - start) as usize;
                let to = chunk.len().min(from + max);
                return Bytes::copy_from_slice(&chunk[from..to]);
            }
            start = end;
        }
        Bytes::new()
    }
}

/// Sending end of one direction, with its replay buffer
pub struct Outbound {
    window: usize,
    max_chunk: usize,
    state: Mutex<ReplayState>,
    progress: watch::Sender<OutboundProgress>,
}

impl Outbound {
    /// `window` bounds the number of retained buffers, `max_chunk` the payload
    /// size of a single data frame.
    pub fn new(window: usize, max_chunk: usize) -> Self {
        assert!(window > 0, "replay window must be positive");
        assert!(max_chunk > 0, "chunk size must be positive");

        let (progress, _) = watch::channel(OutboundProgress::default());
        Self {
            window,
            max_chunk,
            state: Mutex::new(ReplayState {
                chunks: VecDeque::new(),
                base: 0,
                written: 0,
                acked: 0,
                eof: false,
                peer_fin: false,
                peer_window: u64::MAX,
                closed: false,
            }),
            progress,
        }
    }

    /// Limit the bytes in flight to the receive window the peer announced
    ///
    /// Unlimited until a peer announces a window.
    pub fn set_peer_window(&self, window: u64) {
        let mut state = self.state.lock().unwrap();
        if state.peer_window != window {
            trace!("Peer receive window is {} bytes", window);
            state.peer_window = window;
            self.publish(&state);
        }
    }

    fn publish(&self, state: &ReplayState) {
        self.progress.send_replace(state.progress());
    }

    /// Append a filled buffer to the stream, waiting while the window is full
    pub async fn append(&self, buffer: Buffer) -> Result<(), SequenceError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let mut progress = self.progress.subscribe();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(SequenceError::Closed);
                }
                if state.eof {
                    return Err(SequenceError::Finished);
                }
                if state.chunks.len() < self.window {
                    state.written += buffer.len() as u64;
                    state.chunks.push_back(buffer);
                    trace!("Appended to replay buffer, written={}", state.written);
                    self.publish(&state);
                    return Ok(());
                }
            }
            if progress.changed().await.is_err() {
                return Err(SequenceError::Closed);
            }
        }
    }

    /// Mark the end of the stream at the current length
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.eof {
            state.eof = true;
            debug!("Outbound stream finished at {}", state.written);
            self.publish(&state);
        }
    }

    /// Apply the peer's acknowledgment, releasing fully acknowledged buffers
    pub fn acknowledge(&self, ack: u64) -> Result<(), SequenceError> {
        let mut state = self.state.lock().unwrap();
        if ack > state.written {
            return Err(SequenceError::Desync(format!(
                "peer acknowledged {} bytes but only {} were written",
                ack, state.written
            )));
        }
        if ack <= state.acked {
            return Ok(());
        }

        state.acked = ack;
        state.release_acked();
        self.publish(&state);
        Ok(())
    }

    /// The peer has delivered our end of stream
    pub fn peer_finished(&self) -> Result<(), SequenceError> {
        let mut state = self.state.lock().unwrap();
        if !state.eof {
            return Err(SequenceError::Desync(
                "peer acknowledged an end of stream that was never sent".to_string(),
            ));
        }
        if state.peer_fin {
            return Ok(());
        }

        state.acked = state.written;
        state.release_acked();
        state.peer_fin = true;
        self.publish(&state);
        Ok(())
    }

    /// Compute where to resume sending after a reconnect
    ///
    /// `peer_ack` is what the peer reports as delivered. Returns the offset to
    /// re-send from, or a desync if those bytes are no longer retained.
    pub fn resume(&self, peer_ack: u64) -> Result<u64, SequenceError> {
        {
            let state = self.state.lock().unwrap();
            if peer_ack < state.base {
                return Err(SequenceError::Desync(format!(
                    "peer resumes at {} but bytes before {} are no longer retained",
                    peer_ack, state.base
                )));
            }
        }
        self.acknowledge(peer_ack)?;
        Ok(peer_ack)
    }

    /// Wait for the next frame to send from `cursor`
    ///
    /// Cancel safe: nothing is consumed until it is returned.
    pub async fn next_pending(&self, cursor: u64, fin_sent: bool) -> Result<Pending, SequenceError> {
        let mut progress = self.progress.subscribe();
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.closed {
                    return Err(SequenceError::Closed);
                }
                // Bytes the peer already acknowledged are never re-sent.
                let from = cursor.max(state.acked);
                if from < state.written {
                    let limit = state.acked.saturating_add(state.peer_window);
                    if from < limit {
                        let max = (limit - from).min(self.max_chunk as u64) as usize;
                        let payload = state.copy_from(from, max);
                        return Ok(Pending::Data {
                            offset: from,
                            payload,
                        });
                    }
                } else if state.eof && !fin_sent && !state.peer_fin {
                    return Ok(Pending::Fin {
                        length: state.written,
                    });
                }
            }
            if progress.changed().await.is_err() {
                return Err(SequenceError::Closed);
            }
        }
    }

    /// Wait until the peer has delivered everything including the end of stream
    pub async fn completed(&self) -> Result<(), SequenceError> {
        let mut progress = self.progress.subscribe();
        let result = progress
            .wait_for(|p| p.closed || (p.eof && p.peer_fin))
            .await
            .map(|p| p.closed);
        match result {
            Ok(false) => Ok(()),
            _ => Err(SequenceError::Closed),
        }
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.eof && state.peer_fin
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().eof
    }

    pub fn written(&self) -> u64 {
        self.progress.borrow().written
    }

    pub fn acked(&self) -> u64 {
        self.progress.borrow().acked
    }

    /// Number of pool buffers currently retained for replay
    pub fn retained(&self) -> usize {
        self.progress.borrow().retained
    }

    /// Close the direction, releasing retained buffers and waking all waiters
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        state.chunks.clear();
        self.publish(&state);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct InboundProgress {
    delivered: u64,
    fin_delivered: bool,
}

struct InboundState {
    received: u64,
    fin_at: Option<u64>,
    sender: Option<mpsc::UnboundedSender<Bytes>>,
    closed: bool,
}

/// Receiving end of one direction
pub struct Inbound {
    window: u64,
    state: Mutex<InboundState>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    progress: watch::Sender<InboundProgress>,
}

impl Inbound {
    /// `window` bounds the bytes received but not yet delivered
    pub fn new(window: u64) -> Self {
        assert!(window > 0, "receive window must be positive");

        let (sender, receiver) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(InboundProgress::default());
        Self {
            window,
            state: Mutex::new(InboundState {
                received: 0,
                fin_at: None,
                sender: Some(sender),
                closed: false,
            }),
            queue: tokio::sync::Mutex::new(receiver),
            progress,
        }
    }

    /// Receive window announced to the peer, in bytes
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Accept a payload that starts at stream `offset`
    ///
    /// Bytes below `received` are duplicates and dropped; a payload starting
    /// past `received` means bytes were lost. Never waits: a peer that sends
    /// past the receive window is out of sync.
    pub fn accept(&self, offset: u64, payload: Bytes) -> Result<(), SequenceError> {
        let end = offset.checked_add(payload.len() as u64).ok_or_else(|| {
            SequenceError::Desync(format!(
                "payload of {} bytes at offset {} overflows the stream",
                payload.len(),
                offset
            ))
        })?;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SequenceError::Closed);
        }
        if offset > state.received {
            return Err(SequenceError::Desync(format!(
                "gap in stream: expected offset {} but got {}",
                state.received, offset
            )));
        }
        if end <= state.received {
            trace!("Dropping duplicate bytes {}..{}", offset, end);
            return Ok(());
        }
        if let Some(fin) = state.fin_at {
            return Err(SequenceError::Desync(format!(
                "data at {}..{} past end of stream {}",
                offset, end, fin
            )));
        }
        let delivered = self.delivered();
        if end - delivered > self.window {
            return Err(SequenceError::Desync(format!(
                "data up to {} exceeds the receive window of {} bytes past {}",
                end, self.window, delivered
            )));
        }

        let skip = (state.received - offset) as usize;
        match &state.sender {
            Some(sender) => {
                sender
                    .send(payload.slice(skip..))
                    .map_err(|_| SequenceError::Closed)?;
            }
            None => return Err(SequenceError::Closed),
        }
        state.received = end;
        Ok(())
    }

    /// The peer's stream ends at `length`
    pub fn finish(&self, length: u64) -> Result<(), SequenceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(fin) = state.fin_at {
            if fin == length {
                return Ok(());
            }
            return Err(SequenceError::Desync(format!(
                "end of stream moved from {} to {}",
                fin, length
            )));
        }
        if length != state.received {
            return Err(SequenceError::Desync(format!(
                "end of stream at {} but {} bytes were received",
                length, state.received
            )));
        }

        debug!("Inbound stream finished at {}", length);
        state.fin_at = Some(length);
        // Dropping the sender lets the consumer drain the queue and see the end.
        state.sender = None;
        Ok(())
    }

    /// Next chunk for the consumer, `None` once the stream ended or closed
    ///
    /// The consumer must call [`Inbound::consumed`] after handing the chunk on.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut queue = self.queue.lock().await;
        let chunk = queue.recv().await;
        if chunk.is_none() {
            let finished = self.state.lock().unwrap().fin_at.is_some();
            if finished {
                self.progress.send_if_modified(|p| {
                    let changed = !p.fin_delivered;
                    p.fin_delivered = true;
                    changed
                });
            }
        }
        chunk
    }

    /// Confirm `n` bytes were delivered to the final consumer
    pub fn consumed(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.progress.send_modify(|p| p.delivered += n as u64);
    }

    /// Current acknowledgment: bytes delivered and whether the end was delivered
    pub fn ack_state(&self) -> (u64, bool) {
        let p = *self.progress.borrow();
        (p.delivered, p.fin_delivered)
    }

    pub fn delivered(&self) -> u64 {
        self.progress.borrow().delivered
    }

    pub fn received(&self) -> u64 {
        self.state.lock().unwrap().received
    }

    pub fn is_complete(&self) -> bool {
        self.progress.borrow().fin_delivered
    }

    /// Wait for the acknowledgment state to differ from `last`
    pub async fn ack_changed(&self, last: (u64, bool)) -> (u64, bool) {
        let mut progress = self.progress.subscribe();
        let result = progress
            .wait_for(|p| (p.delivered, p.fin_delivered) != last)
            .await
            .map(|p| (p.delivered, p.fin_delivered));
        match result {
            Ok(state) => state,
            // The sender lives as long as `self`.
            Err(_) => std::future::pending().await,
        }
    }

    /// Stop accepting data; the consumer drains what is queued and then sees `None`
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use std::time::Duration;

    async fn filled(pool: &BufferPool, bytes: &[u8]) -> Buffer {
        let mut buffer = pool.get().await;
        buffer.fill_from(bytes);
        buffer
    }

    #[tokio::test]
    async fn test_outbound_sends_in_order() {
        let pool = BufferPool::new(8, 8);
        let outbound = Outbound::new(4, 1024);

        outbound.append(filled(&pool, b"abc").await).await.unwrap();
        outbound.append(filled(&pool, b"defg").await).await.unwrap();

        assert_eq!(
            outbound.next_pending(0, false).await.unwrap(),
            Pending::Data {
                offset: 0,
                payload: Bytes::from_static(b"abc")
            }
        );
        assert_eq!(
            outbound.next_pending(3, false).await.unwrap(),
            Pending::Data {
                offset: 3,
                payload: Bytes::from_static(b"defg")
            }
        );
        // A cursor inside a chunk yields the rest of that chunk.
        assert_eq!(
            outbound.next_pending(5, false).await.unwrap(),
            Pending::Data {
                offset: 5,
                payload: Bytes::from_static(b"fg")
            }
        );
    }

    #[tokio::test]
    async fn test_outbound_releases_on_ack() {
        let pool = BufferPool::new(8, 8);
        let outbound = Outbound::new(4, 1024);

        outbound.append(filled(&pool, b"abc").await).await.unwrap();
        outbound.append(filled(&pool, b"def").await).await.unwrap();
        assert_eq!(pool.outstanding(), 2);

        outbound.acknowledge(2).unwrap();
        assert_eq!(outbound.retained(), 2);

        outbound.acknowledge(3).unwrap();
        assert_eq!(outbound.retained(), 1);
        assert_eq!(pool.outstanding(), 1);

        // Stale acknowledgments are ignored.
        outbound.acknowledge(1).unwrap();
        assert_eq!(outbound.acked(), 3);
    }

    #[tokio::test]
    async fn test_outbound_rejects_ack_past_written() {
        let pool = BufferPool::new(8, 8);
        let outbound = Outbound::new(4, 1024);
        outbound.append(filled(&pool, b"abc").await).await.unwrap();

        assert!(matches!(
            outbound.acknowledge(4),
            Err(SequenceError::Desync(_))
        ));
    }

    #[tokio::test]
    async fn test_outbound_window_blocks_producer() {
        let pool = BufferPool::new(8, 8);
        let outbound = std::sync::Arc::new(Outbound::new(2, 1024));

        outbound.append(filled(&pool, b"a").await).await.unwrap();
        outbound.append(filled(&pool, b"b").await).await.unwrap();

        let producer = {
            let outbound = outbound.clone();
            let buffer = filled(&pool, b"c").await;
            tokio::spawn(async move { outbound.append(buffer).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        outbound.acknowledge(1).unwrap();
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume once the window opens")
            .unwrap()
            .unwrap();
        assert_eq!(outbound.written(), 3);
    }

    #[tokio::test]
    async fn test_outbound_respects_peer_window() {
        let pool = BufferPool::new(8, 8);
        let outbound = std::sync::Arc::new(Outbound::new(4, 1024));
        outbound.append(filled(&pool, b"abcdef").await).await.unwrap();
        outbound.finish();
        outbound.set_peer_window(4);

        assert_eq!(
            outbound.next_pending(0, false).await.unwrap(),
            Pending::Data {
                offset: 0,
                payload: Bytes::from_static(b"abcd")
            }
        );

        // Window exhausted: neither data nor the end of stream goes out.
        let waiter = {
            let outbound = outbound.clone();
            tokio::spawn(async move { outbound.next_pending(4, false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        outbound.acknowledge(2).unwrap();
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            Pending::Data {
                offset: 4,
                payload: Bytes::from_static(b"ef")
            }
        );
    }

    #[tokio::test]
    async fn test_resume_rewinds_to_peer_ack() {
        let pool = BufferPool::new(8, 8);
        let outbound = Outbound::new(4, 1024);
        outbound.append(filled(&pool, b"abcdef").await).await.unwrap();

        // Everything was sent, the peer only delivered 2 bytes before the drop.
        let cursor = outbound.resume(2).unwrap();
        assert_eq!(cursor, 2);
        assert_eq!(
            outbound.next_pending(cursor, false).await.unwrap(),
            Pending::Data {
                offset: 2,
                payload: Bytes::from_static(b"cdef")
            }
        );
    }

    #[tokio::test]
    async fn test_resume_below_retained_is_desync() {
        let pool = BufferPool::new(8, 8);
        let outbound = Outbound::new(4, 1024);
        outbound.append(filled(&pool, b"abc").await).await.unwrap();
        outbound.append(filled(&pool, b"def").await).await.unwrap();
        outbound.acknowledge(3).unwrap();

        assert!(matches!(outbound.resume(1), Err(SequenceError::Desync(_))));
        assert!(matches!(outbound.resume(7), Err(SequenceError::Desync(_))));
        assert_eq!(outbound.resume(3).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fin_and_completion() {
        let pool = BufferPool::new(8, 8);
        let outbound = Outbound::new(4, 1024);
        outbound.append(filled(&pool, b"abc").await).await.unwrap();
        outbound.finish();

        assert_eq!(
            outbound.next_pending(3, false).await.unwrap(),
            Pending::Fin { length: 3 }
        );
        assert!(!outbound.is_complete());

        outbound.peer_finished().unwrap();
        assert!(outbound.is_complete());
        assert_eq!(outbound.retained(), 0);
        outbound.completed().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let outbound = std::sync::Arc::new(Outbound::new(4, 1024));
        let waiter = {
            let outbound = outbound.clone();
            tokio::spawn(async move { outbound.next_pending(0, false).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        outbound.close();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(SequenceError::Closed));
    }

    #[tokio::test]
    async fn test_inbound_discards_duplicates() {
        let inbound = Inbound::new(1024);

        inbound.accept(0, Bytes::from_static(b"hello")).unwrap();
        // Retransmission overlapping what was already received.
        inbound
            .accept(3, Bytes::from_static(b"lo world"))
            .unwrap();
        inbound.accept(0, Bytes::from_static(b"hel")).unwrap();

        assert_eq!(inbound.received(), 11);
        assert_eq!(inbound.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            inbound.recv().await.unwrap(),
            Bytes::from_static(b" world")
        );
    }

    #[tokio::test]
    async fn test_inbound_gap_is_desync() {
        let inbound = Inbound::new(1024);
        inbound.accept(0, Bytes::from_static(b"abc")).unwrap();

        let result = inbound.accept(5, Bytes::from_static(b"xyz"));
        assert!(matches!(result, Err(SequenceError::Desync(_))));
    }

    #[tokio::test]
    async fn test_inbound_offset_overflow_is_desync() {
        let inbound = Inbound::new(1024);

        let result = inbound.accept(u64::MAX - 1, Bytes::from_static(b"0123456789"));
        assert!(matches!(result, Err(SequenceError::Desync(_))));
        assert_eq!(inbound.received(), 0);
    }

    #[tokio::test]
    async fn test_inbound_enforces_receive_window() {
        let inbound = Inbound::new(8);
        inbound.accept(0, Bytes::from_static(b"abcdef")).unwrap();

        // Two more bytes fit, a third would overrun what was announced.
        let result = inbound.accept(6, Bytes::from_static(b"ghi"));
        assert!(matches!(result, Err(SequenceError::Desync(_))));
        inbound.accept(6, Bytes::from_static(b"gh")).unwrap();

        // Delivery opens the window again.
        let chunk = inbound.recv().await.unwrap();
        inbound.consumed(chunk.len());
        inbound.accept(8, Bytes::from_static(b"ijklmn")).unwrap();
        assert_eq!(inbound.received(), 14);
    }

    #[tokio::test]
    async fn test_inbound_ack_tracks_delivery() {
        let inbound = Inbound::new(1024);
        inbound.accept(0, Bytes::from_static(b"abcd")).unwrap();

        assert_eq!(inbound.ack_state(), (0, false));
        let chunk = inbound.recv().await.unwrap();
        inbound.consumed(chunk.len());
        assert_eq!(inbound.ack_state(), (4, false));

        inbound.finish(4).unwrap();
        assert!(inbound.recv().await.is_none());
        assert_eq!(inbound.ack_state(), (4, true));
        assert!(inbound.is_complete());
    }

    #[tokio::test]
    async fn test_inbound_fin_must_match_received() {
        let inbound = Inbound::new(1024);
        inbound.accept(0, Bytes::from_static(b"abcd")).unwrap();

        assert!(matches!(inbound.finish(6), Err(SequenceError::Desync(_))));
        inbound.finish(4).unwrap();
        // A retransmitted end of stream is harmless.
        inbound.finish(4).unwrap();
        assert!(matches!(inbound.finish(5), Err(SequenceError::Desync(_))));
    }

    #[tokio::test]
    async fn test_ack_changed_wakes_on_delivery() {
        let inbound = std::sync::Arc::new(Inbound::new(1024));
        let waiter = {
            let inbound = inbound.clone();
            tokio::spawn(async move { inbound.ack_changed((0, false)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        inbound.consumed(5);

        assert_eq!(waiter.await.unwrap(), (5, false));
    }
}
