//! The streaming core: connection registry, backpressure, and cleanup

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::streaming::connection::{
    ConnectionKind, ConnectionState, InternalStream, StreamConnection,
};
use crate::streaming::frames::{MetadataFrame, StreamFrame, TokenFrame};

/// Streaming errors
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("connection limit {0} reached")]
    AtCapacity(usize),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Streaming core tunables
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Maximum simultaneously open connections
    pub max_connections: usize,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Rolling mean send latency above which a consumer is slow
    pub slow_latency: Duration,
    /// Queue occupancy fraction above which a consumer is slow
    pub slow_occupancy_fraction: f64,
    /// Cooperative delay inserted before emissions to slow consumers
    pub backpressure_delay: Duration,
    /// Idle time after which the sweep closes a connection
    pub idle_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            queue_capacity: 1000,
            slow_latency: Duration::from_secs(10),
            slow_occupancy_fraction: 0.8,
            backpressure_delay: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Writes encoded frames to an external consumer
///
/// The framing (SSE-like or WebSocket-like) is applied before this is
/// called; implementations only move bytes.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Deliver one encoded frame
    async fn send(&self, text: String) -> Result<(), String>;
}

/// Owns every active connection and enforces the flow-control policy
pub struct StreamingCore {
    config: StreamingConfig,
    connections: DashMap<String, Arc<StreamConnection>>,
    drains: DashMap<String, tokio::task::JoinHandle<()>>,
}

impl StreamingCore {
    /// Create a streaming core
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            drains: DashMap::new(),
        }
    }

    fn admit(&self, id: &str) -> StreamResult<()> {
        if self.connections.len() >= self.config.max_connections {
            return Err(StreamError::AtCapacity(self.config.max_connections));
        }
        if self.connections.contains_key(id) {
            return Err(StreamError::Closed(format!(
                "connection id {} already active",
                id
            )));
        }
        Ok(())
    }

    /// Open an in-process connection, returning the pull side
    pub fn open_internal(
        &self,
        id: &str,
    ) -> StreamResult<(Arc<StreamConnection>, InternalStream)> {
        self.admit(id)?;
        let (connection, rx) =
            StreamConnection::new(id, ConnectionKind::Internal, self.config.queue_capacity);
        let connection = Arc::new(connection);
        self.connections.insert(id.to_string(), Arc::clone(&connection));
        tracing::debug!(id, "internal stream opened");
        Ok((connection, InternalStream::new(rx)))
    }

    /// Open an external connection drained to `adapter`
    ///
    /// A drain task encodes frames per the connection kind, measures each
    /// transport send, and tears the connection down at the close frame.
    pub fn open_external(
        &self,
        id: &str,
        kind: ConnectionKind,
        adapter: Arc<dyn TransportAdapter>,
    ) -> StreamResult<Arc<StreamConnection>> {
        self.admit(id)?;
        let (connection, rx) = StreamConnection::new(id, kind, self.config.queue_capacity);
        let connection = Arc::new(connection);
        self.connections.insert(id.to_string(), Arc::clone(&connection));

        let drain = tokio::spawn(Self::drain_loop(Arc::clone(&connection), rx, adapter));
        self.drains.insert(id.to_string(), drain);
        tracing::debug!(id, ?kind, "external stream opened");
        Ok(connection)
    }

    async fn drain_loop(
        connection: Arc<StreamConnection>,
        mut rx: mpsc::Receiver<StreamFrame>,
        adapter: Arc<dyn TransportAdapter>,
    ) {
        while let Some(frame) = rx.recv().await {
            let is_close = matches!(frame, StreamFrame::Close(_));
            let encoded = match connection.kind() {
                ConnectionKind::ServerSentEventsLike => frame.to_sse(),
                _ => frame.to_ws_text(),
            };

            let started = Instant::now();
            if let Err(err) = adapter.send(encoded).await {
                tracing::warn!(id = connection.id(), error = %err, "transport send failed");
                connection.set_state(ConnectionState::Error);
                break;
            }
            connection.record_latency(started.elapsed());

            if is_close {
                break;
            }
        }
        connection.set_state(ConnectionState::Disconnected);
    }

    /// Look up an active connection
    pub fn connection(&self, id: &str) -> Option<Arc<StreamConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Emit a token toward a connection
    ///
    /// Slow consumers get a short cooperative delay first; the enqueue
    /// itself never blocks, returning `false` when the queue is full.
    pub async fn send_token(&self, id: &str, frame: TokenFrame) -> bool {
        let Some(connection) = self.connection(id) else {
            return false;
        };
        if connection.is_slow(
            self.config.slow_occupancy_fraction,
            self.config.slow_latency,
        ) {
            connection.set_state(ConnectionState::Paused);
            tokio::time::sleep(self.config.backpressure_delay).await;
            if connection.state() == ConnectionState::Paused {
                connection.set_state(ConnectionState::Streaming);
            }
        }
        connection.send_token(frame)
    }

    /// Emit a metadata frame toward a connection
    pub async fn send_metadata(&self, id: &str, frame: MetadataFrame) -> bool {
        match self.connection(id) {
            Some(connection) => connection.send_metadata(frame),
            None => false,
        }
    }

    /// Close and deregister a connection
    pub fn close(&self, id: &str, reason: &str, message: Option<String>) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };
        connection.close(reason, message);
        // The drain task exits on the close frame; dropping the handle
        // leaves it to finish in-flight writes.
        self.drains.remove(id);
        tracing::debug!(id, reason, "stream closed");
        true
    }

    /// Close every connection idle past the configured timeout
    pub fn sweep_idle(&self) -> usize {
        let idle: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() > self.config.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let count = idle.len();
        for id in idle {
            self.close(&id, "inactive", None);
        }
        if count > 0 {
            tracing::info!(count, "closed inactive streams");
        }
        count
    }

    /// Number of active connections
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Close everything, used during shutdown
    pub fn close_all(&self, reason: &str) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id, reason, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn core(queue_capacity: usize) -> StreamingCore {
        StreamingCore::new(StreamingConfig {
            queue_capacity,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let core = StreamingCore::new(StreamingConfig {
            max_connections: 2,
            ..Default::default()
        });
        core.open_internal("a").unwrap();
        core.open_internal("b").unwrap();
        let err = core.open_internal("c").unwrap_err();
        assert!(matches!(err, StreamError::AtCapacity(2)));

        core.close("a", "done", None);
        assert!(core.open_internal("c").is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let core = core(10);
        core.open_internal("a").unwrap();
        assert!(core.open_internal("a").is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_sees_all_tokens_in_order() {
        let core = Arc::new(core(4));
        let (_connection, mut stream) = core.open_internal("s").unwrap();

        let producer = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                let mut rejected = 0u32;
                for i in 0..20u64 {
                    loop {
                        if core.send_token("s", TokenFrame::new(format!("t{}", i), i)).await {
                            break;
                        }
                        rejected += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
                core.close("s", "stop", None);
                rejected
            })
        };

        let mut indices = Vec::new();
        while let Some(frame) = stream.next_token().await {
            indices.push(frame.token_index);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let rejected = producer.await.unwrap();
        assert_eq!(indices, (0..20).collect::<Vec<u64>>());
        assert!(rejected > 0, "queue of 4 must saturate at least once");
    }

    #[tokio::test]
    async fn test_external_drain_applies_framing() {
        struct Capture(Mutex<Vec<String>>);

        #[async_trait]
        impl TransportAdapter for Capture {
            async fn send(&self, text: String) -> Result<(), String> {
                self.0.lock().push(text);
                Ok(())
            }
        }

        let core = core(10);
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let connection = core
            .open_external("e", ConnectionKind::ServerSentEventsLike, capture.clone())
            .unwrap();

        connection.send_token(TokenFrame::new("hi", 0));
        connection.close("stop", None);

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if capture.0.lock().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("drain did not deliver frames");

        let sent = capture.0.lock();
        assert!(sent[0].starts_with("event: token\n"));
        assert!(sent[1].starts_with("event: close\n"));
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_connections() {
        let core = StreamingCore::new(StreamingConfig {
            idle_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let (_connection, mut stream) = core.open_internal("stale").unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(core.sweep_idle(), 1);
        assert_eq!(core.active_connections(), 0);

        // Consumer observes the inactive close.
        match stream.next().await {
            Some(StreamFrame::Close(close)) => assert_eq!(close.reason, "inactive"),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_false() {
        let core = core(10);
        assert!(!core.send_token("ghost", TokenFrame::new("x", 0)).await);
    }
}
