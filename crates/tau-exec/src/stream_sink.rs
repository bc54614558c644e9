//! Event sink consumed by the streamed run strategy.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates events produced by a streamed run, in delivery order per channel.
pub enum StreamEvent {
    Stdout(String),
    Stderr(String),
    Error(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream sink closed")]
/// Returned when the consumer of a stream has gone away.
pub struct StreamSinkClosed;

/// Trait contract for `StreamSink` behavior.
///
/// Both pipe readers deliver into the same sink concurrently, so
/// implementations must tolerate interleaved calls.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn emit(&self, event: StreamEvent) -> Result<(), StreamSinkClosed>;

    async fn on_stdout_line(&self, line: String) -> Result<(), StreamSinkClosed> {
        self.emit(StreamEvent::Stdout(line)).await
    }

    async fn on_stderr_line(&self, line: String) -> Result<(), StreamSinkClosed> {
        self.emit(StreamEvent::Stderr(line)).await
    }

    async fn on_error(&self, message: String) -> Result<(), StreamSinkClosed> {
        self.emit(StreamEvent::Error(message)).await
    }

    async fn on_close(&self) -> Result<(), StreamSinkClosed> {
        self.emit(StreamEvent::Close).await
    }
}

#[derive(Debug, Clone)]
/// Forwards events into a bounded channel, applying backpressure to the readers.
pub struct ChannelStreamSink {
    sender: mpsc::Sender<StreamEvent>,
}

impl ChannelStreamSink {
    pub fn new(sender: mpsc::Sender<StreamEvent>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl StreamSink for ChannelStreamSink {
    async fn emit(&self, event: StreamEvent) -> Result<(), StreamSinkClosed> {
        self.sender.send(event).await.map_err(|_| StreamSinkClosed)
    }
}
