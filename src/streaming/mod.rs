//! Token streaming with per-connection flow control
//!
//! This module provides:
//! - Wire frames (token, metadata, close) with SSE-like and WebSocket-like
//!   encodings
//! - Bounded per-connection outbound queues that never block the producer
//! - Slow-consumer detection with a cooperative backpressure delay
//! - An idle-connection cleanup sweep and an in-process pull consumer

pub mod connection;
pub mod frames;
pub mod manager;

pub use connection::{ConnectionKind, ConnectionState, InternalStream, StreamConnection};
pub use frames::{CloseFrame, MetadataFrame, StreamFrame, TokenFrame};
pub use manager::{StreamError, StreamResult, StreamingConfig, StreamingCore, TransportAdapter};
