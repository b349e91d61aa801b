//! Per-connection state, bounded queueing, and latency tracking

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::streaming::frames::{CloseFrame, MetadataFrame, StreamFrame, TokenFrame};

/// Send-latency samples retained per connection
const LATENCY_SAMPLES: usize = 10;

/// Transport family of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    WebSocketLike,
    ServerSentEventsLike,
    Internal,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Streaming,
    Paused,
    Error,
    Disconnected,
}

/// One consumer's stream endpoint
///
/// The outbound queue is bounded; senders get `false` instead of blocking
/// when it is full, and the caller decides whether to retry or drop.
#[derive(Debug)]
pub struct StreamConnection {
    id: String,
    kind: ConnectionKind,
    state: Mutex<ConnectionState>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    tx: mpsc::Sender<StreamFrame>,
    capacity: usize,
    latencies: Mutex<VecDeque<Duration>>,
}

impl StreamConnection {
    /// Build a connection over a fresh bounded channel
    pub(crate) fn new(
        id: impl Into<String>,
        kind: ConnectionKind,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let connection = Self {
            id: id.into(),
            kind,
            state: Mutex::new(ConnectionState::Connected),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            tx,
            capacity,
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
        };
        (connection, rx)
    }

    /// Connection id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport family
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last successful enqueue
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn try_enqueue(&self, frame: StreamFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.mark_active();
                true
            }
            Err(_) => false,
        }
    }

    /// Enqueue a token frame; `false` when the queue is full or closed
    pub fn send_token(&self, frame: TokenFrame) -> bool {
        if self.state() == ConnectionState::Disconnected {
            return false;
        }
        let sent = self.try_enqueue(StreamFrame::Token(frame));
        if sent && self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Streaming);
        }
        sent
    }

    /// Enqueue a metadata frame; `false` when the queue is full or closed
    pub fn send_metadata(&self, frame: MetadataFrame) -> bool {
        if self.state() == ConnectionState::Disconnected {
            return false;
        }
        self.try_enqueue(StreamFrame::Metadata(frame))
    }

    /// Transition to Disconnected, enqueueing a close frame best-effort
    pub fn close(&self, reason: impl Into<String>, message: Option<String>) {
        let reason = reason.into();
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let _ = self.try_enqueue(StreamFrame::Close(CloseFrame {
            reason,
            message,
        }));
        self.set_state(ConnectionState::Disconnected);
    }

    /// Frames currently queued and not yet drained
    pub fn occupancy(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record one transport send latency sample
    pub fn record_latency(&self, sample: Duration) {
        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(sample);
    }

    /// Mean of the rolling latency window
    pub fn mean_latency(&self) -> Duration {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    }

    /// Slow-consumer test: queue mostly full, or transport sends dragging
    pub fn is_slow(&self, occupancy_fraction: f64, latency_threshold: Duration) -> bool {
        let threshold = (self.capacity as f64 * occupancy_fraction) as usize;
        self.occupancy() > threshold || self.mean_latency() > latency_threshold
    }
}

/// Pull-side handle for in-process consumers
///
/// Yields frames in order; after the close frame (or once every sender is
/// gone) `next` returns `None` as the end-of-stream sentinel.
#[derive(Debug)]
pub struct InternalStream {
    rx: mpsc::Receiver<StreamFrame>,
    finished: bool,
}

impl InternalStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamFrame>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    /// Next frame, or `None` at end of stream
    pub async fn next(&mut self) -> Option<StreamFrame> {
        if self.finished {
            return None;
        }
        let frame = self.rx.recv().await;
        if matches!(frame, Some(StreamFrame::Close(_)) | None) {
            self.finished = true;
        }
        frame
    }

    /// Next token frame, skipping metadata; `None` at end of stream
    pub async fn next_token(&mut self) -> Option<TokenFrame> {
        loop {
            match self.next().await? {
                StreamFrame::Token(frame) => return Some(frame),
                StreamFrame::Metadata(_) => continue,
                StreamFrame::Close(_) => return None,
            }
        }
    }

    /// Drain the remaining tokens into a single string
    pub async fn collect_text(&mut self) -> String {
        let mut text = String::new();
        while let Some(frame) = self.next_token().await {
            text.push_str(&frame.token);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_queue_returns_false_when_full() {
        let (connection, _rx) = StreamConnection::new("c1", ConnectionKind::Internal, 2);
        assert!(connection.send_token(TokenFrame::new("a", 0)));
        assert!(connection.send_token(TokenFrame::new("b", 1)));
        assert!(!connection.send_token(TokenFrame::new("c", 2)), "queue full");
        assert_eq!(connection.occupancy(), 2);
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let (connection, rx) = StreamConnection::new("c1", ConnectionKind::Internal, 10);
        for i in 0..5u64 {
            assert!(connection.send_token(TokenFrame::new(format!("t{}", i), i)));
        }
        connection.close("stop", None);

        let mut stream = InternalStream::new(rx);
        let mut indices = Vec::new();
        while let Some(frame) = stream.next_token().await {
            indices.push(frame.token_index);
        }
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_is_sentinel_for_pull_consumer() {
        let (connection, rx) = StreamConnection::new("c1", ConnectionKind::Internal, 10);
        connection.send_token(TokenFrame::new("only", 0));
        connection.close("stop", None);

        let mut stream = InternalStream::new(rx);
        assert!(matches!(stream.next().await, Some(StreamFrame::Token(_))));
        assert!(matches!(stream.next().await, Some(StreamFrame::Close(_))));
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none(), "stays finished");
    }

    #[tokio::test]
    async fn test_sends_after_close_rejected() {
        let (connection, _rx) = StreamConnection::new("c1", ConnectionKind::Internal, 10);
        connection.close("inactive", None);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.send_token(TokenFrame::new("late", 0)));
    }

    #[tokio::test]
    async fn test_slow_detection_by_occupancy() {
        let (connection, _rx) = StreamConnection::new("c1", ConnectionKind::Internal, 10);
        for i in 0..9u64 {
            connection.send_token(TokenFrame::new("x", i));
        }
        assert!(connection.is_slow(0.8, Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_slow_detection_by_latency() {
        let (connection, _rx) = StreamConnection::new("c1", ConnectionKind::Internal, 10);
        assert!(!connection.is_slow(0.8, Duration::from_secs(10)));
        for _ in 0..10 {
            connection.record_latency(Duration::from_secs(11));
        }
        assert!(connection.is_slow(0.8, Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_latency_window_bounded() {
        let (connection, _rx) = StreamConnection::new("c1", ConnectionKind::Internal, 10);
        for _ in 0..50 {
            connection.record_latency(Duration::from_millis(5));
        }
        assert_eq!(connection.latencies.lock().len(), 10);
    }
}
