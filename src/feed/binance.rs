use anyhow::Context;
use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Channel, MessageStream, Transport};

pub const TRADE_WS_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@trade";
pub const DEPTH_WS_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@depth20@100ms";

/// Public Binance streams. One websocket per channel.
#[derive(Debug, Clone)]
pub struct BinanceTransport {
    trade_url: String,
    depth_url: String,
}

impl Default for BinanceTransport {
    fn default() -> Self {
        Self::new(TRADE_WS_URL.to_string(), DEPTH_WS_URL.to_string())
    }
}

impl BinanceTransport {
    pub fn new(trade_url: String, depth_url: String) -> Self {
        Self { trade_url, depth_url }
    }

    pub fn url_for(&self, channel: Channel) -> &str {
        match channel {
            Channel::Trades => &self.trade_url,
            Channel::Depth => &self.depth_url,
        }
    }
}

#[async_trait]
impl Transport for BinanceTransport {
    async fn open(&self, channel: Channel) -> anyhow::Result<MessageStream> {
        let url = self.url_for(channel);
        let (ws, resp) = connect_async(url)
            .await
            .with_context(|| format!("ws connect {}", url))?;
        tracing::debug!(channel = %channel, status = %resp.status(), "ws handshake done");

        // tungstenite answers pings itself; only text frames carry market data
        let frames = ws.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    Some(Err(anyhow::anyhow!("server closed stream: {:?}", frame)))
                }
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::new(e).context("ws read"))),
            })
        });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_per_channel() {
        let t = BinanceTransport::default();
        assert!(t.url_for(Channel::Trades).ends_with("btcusdt@trade"));
        assert!(t.url_for(Channel::Depth).ends_with("btcusdt@depth20@100ms"));
    }
}
