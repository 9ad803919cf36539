//! Byte-message transports the lifecycle manager runs over.

mod websocket;

pub use websocket::WebSocketTransport;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Everything needed to open one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Transport-level ping carrying `payload`.
    async fn ping(&mut self, payload: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection. `None` means the peer closed.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<Bytes>>;
}

pub type BoxSink = Box<dyn FrameSink>;
pub type BoxStream = Box<dyn FrameStream>;

/// Writer shared by the receive loop (acks) and the heartbeat task.
pub type SharedSink = Arc<tokio::sync::Mutex<BoxSink>>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<(BoxSink, BoxStream)>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn connect(&self, request: &ConnectRequest) -> Result<(BoxSink, BoxStream)> {
        (**self).connect(request).await
    }
}
