//! # sentinel-feed
//!
//! Live price feed supervision: one reconnecting, heartbeated connection per
//! `network:token` key, multiplexed to every consumer interested in it.
//!
//! - **Supervisor** (`supervisor`): subscribe/unsubscribe, last price, status
//! - **Transport** (`transport`, `ws`): connection seam and its WebSocket impl
//! - **Frames** (`json_parser`): subscribe/tick/pong JSON frames
//! - **Reconnect** (`reconnect`): exponential backoff with jitter
//! - **Heartbeat** (`heartbeat`): ping/pong deadline tracking
//! - **Batching** (`batch`): time-windowed outbound batches

pub mod batch;
mod connection;
pub mod heartbeat;
pub mod json_parser;
pub mod reconnect;
pub mod supervisor;
pub mod transport;
pub mod ws;

pub use batch::Delivery;
pub use connection::{ConsumerId, FeedCallback, FeedEvent};
pub use supervisor::{FeedStatus, PriceFeedSupervisor};
pub use transport::{FeedReader, FeedTransport, FeedWriter, Frame};
pub use ws::{PingPayload, WsTransport};
