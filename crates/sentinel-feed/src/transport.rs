//! Connection abstraction under the supervisor.
//!
//! A connect yields separate write and read halves so the session loop can
//! wait on inbound frames while also sending pings and batches.

use async_trait::async_trait;
use sentinel_core::types::FeedKey;

/// Inbound frame as seen by the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    /// Transport-level ping from the server; must be answered.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong,
    Close(Option<String>),
}

#[async_trait]
pub trait FeedWriter: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;

    /// Send this transport's heartbeat ping.
    async fn send_ping(&mut self) -> anyhow::Result<()>;

    async fn send_pong(&mut self, payload: Vec<u8>) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait FeedReader: Send {
    /// Next frame, or `None` once the stream has ended. Must be cancel-safe.
    async fn next_frame(&mut self) -> Option<anyhow::Result<Frame>>;
}

pub type FeedWriterBox = Box<dyn FeedWriter>;
pub type FeedReaderBox = Box<dyn FeedReader>;

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, key: &FeedKey) -> anyhow::Result<(FeedWriterBox, FeedReaderBox)>;
}
