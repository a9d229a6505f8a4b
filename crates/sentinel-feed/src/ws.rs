//! WebSocket transport over `tokio-tungstenite`.

use std::collections::HashMap;

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sentinel_core::config::FeedConfig;
use sentinel_core::types::FeedKey;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::transport::{FeedReader, FeedReaderBox, FeedTransport, FeedWriter, FeedWriterBox, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping payload format, varies by feed provider.
#[derive(Debug, Clone, PartialEq)]
pub enum PingPayload {
    /// Send a text frame (e.g. `"ping"`).
    Text(String),
    /// Send a JSON object as text (e.g. `{"op":"ping"}`).
    Json(serde_json::Value),
    /// Use the standard WebSocket ping frame.
    WebSocketPing,
}

impl PingPayload {
    /// `None` means ping frames; text that parses as a JSON object is sent as JSON.
    pub fn from_config(text: Option<&str>) -> Self {
        match text {
            None => Self::WebSocketPing,
            Some(t) => match serde_json::from_str::<serde_json::Value>(t) {
                Ok(v) if v.is_object() => Self::Json(v),
                _ => Self::Text(t.to_string()),
            },
        }
    }

    fn to_message(&self) -> Message {
        match self {
            Self::Text(t) => Message::Text(t.clone().into()),
            Self::Json(j) => Message::Text(j.to_string().into()),
            Self::WebSocketPing => Message::Ping(Vec::new().into()),
        }
    }
}

/// Opens one WebSocket per feed key.
///
/// The URL may contain `{network}` and `{token}` placeholders for providers
/// that route streams by path.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    extra_headers: HashMap<String, String>,
    ping: PingPayload,
}

impl WsTransport {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            url: config.url.clone(),
            extra_headers: config.extra_headers.clone(),
            ping: PingPayload::from_config(config.ping_text.as_deref()),
        }
    }

    fn url_for(&self, key: &FeedKey) -> String {
        self.url.replace("{network}", &key.network).replace("{token}", &key.token_address)
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, key: &FeedKey) -> anyhow::Result<(FeedWriterBox, FeedReaderBox)> {
        let url = self.url_for(key);
        let parsed = url::Url::parse(&url).with_context(|| format!("invalid feed url {url}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            bail!("feed url must be ws:// or wss://, got {url}");
        }

        let mut request = url.as_str().into_client_request()?;
        for (name, value) in &self.extra_headers {
            request
                .headers_mut()
                .insert(HeaderName::from_bytes(name.as_bytes())?, HeaderValue::from_str(value)?);
        }

        debug!("[feed {key}] connecting to {}", parsed.host_str().unwrap_or(""));
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .with_context(|| format!("connect {url}"))?;
        let (write, read) = stream.split();

        Ok((Box::new(WsWriter { sink: write, ping: self.ping.clone() }), Box::new(WsReader { stream: read })))
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    ping: PingPayload,
}

#[async_trait]
impl FeedWriter for WsWriter {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_ping(&mut self) -> anyhow::Result<()> {
        self.sink.send(self.ping.to_message()).await?;
        Ok(())
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.sink.send(Message::Pong(payload.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FeedReader for WsReader {
    async fn next_frame(&mut self) -> Option<anyhow::Result<Frame>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(e.into())),
            };
            let frame = match msg {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => Frame::Text(text.to_owned()),
                    Err(_) => continue,
                },
                Message::Ping(data) => Frame::Ping(data.to_vec()),
                Message::Pong(_) => Frame::Pong,
                Message::Close(reason) => Frame::Close(reason.map(|r| r.reason.as_str().to_owned())),
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_payload_from_config() {
        assert_eq!(PingPayload::from_config(None), PingPayload::WebSocketPing);
        assert_eq!(PingPayload::from_config(Some("ping")), PingPayload::Text("ping".into()));
        assert!(matches!(PingPayload::from_config(Some(r#"{"op":"ping"}"#)), PingPayload::Json(_)));
    }

    #[test]
    fn url_placeholders() {
        let cfg = FeedConfig { url: "wss://feed.example/{network}/{token}".into(), ..Default::default() };
        let t = WsTransport::new(&cfg);
        assert_eq!(t.url_for(&FeedKey::new("base", "0xabc")), "wss://feed.example/base/0xabc");
    }
}
