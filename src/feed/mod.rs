pub mod binance;
pub mod parse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::stats::Stats;
use crate::types::{PriceTick, RawDepth};

const EVENT_BUFFER: usize = 1024;

pub use binance::BinanceTransport;
pub use parse::{parse_depth, parse_trade, FeedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Trades,
    Depth,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Trades => f.write_str("trades"),
            Channel::Depth => f.write_str("depth"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trade" | "trades" => Ok(Channel::Trades),
            "depth" | "book" => Ok(Channel::Depth),
            other => anyhow::bail!("unknown feed channel: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(PriceTick),
    Depth(RawDepth),
    Connection { channel: Channel, connected: bool },
}

/// Text frames of one streaming connection. Ends (or yields an error) when the connection drops.
pub type MessageStream = BoxStream<'static, anyhow::Result<String>>;

/// Opens one streaming connection for a channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, channel: Channel) -> anyhow::Result<MessageStream>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub channels: Vec<Channel>,
    pub reconnect_delay: Duration,
}

/// Owns one reconnecting task per channel. Events from all channels go to one queue;
/// order within a channel is arrival order.
pub struct MarketFeed {
    transport: Arc<dyn Transport>,
    config: FeedConfig,
    events: mpsc::Sender<FeedEvent>,
    status: HashMap<Channel, watch::Sender<bool>>,
    shutdown: watch::Sender<bool>,
    tasks: HashMap<Channel, JoinHandle<()>>,
    stats: Arc<Stats>,
}

impl MarketFeed {
    /// Nothing is opened until `connect`. The receiver carries every channel's events.
    pub fn new(
        config: FeedConfig,
        transport: Arc<dyn Transport>,
        stats: Arc<Stats>,
    ) -> (Self, mpsc::Receiver<FeedEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let status = config.channels.iter().map(|c| (*c, watch::channel(false).0)).collect();
        let (shutdown, _) = watch::channel(false);
        (Self { transport, config, events, status, shutdown, tasks: HashMap::new(), stats }, rx)
    }

    /// Starts a task for every channel that does not already have a live one.
    pub fn connect(&mut self) {
        self.shutdown.send_replace(false);
        for channel in self.config.channels.clone() {
            if self.tasks.get(&channel).is_some_and(|h| !h.is_finished()) {
                tracing::debug!(channel = %channel, "feed channel already running");
                continue;
            }
            let Some(status) = self.status.get(&channel).cloned() else { continue };
            let task = ChannelTask {
                channel,
                transport: self.transport.clone(),
                delay: self.config.reconnect_delay,
                events: self.events.clone(),
                status,
                shutdown: self.shutdown.subscribe(),
                stats: self.stats.clone(),
            };
            self.tasks.insert(channel, tokio::spawn(task.run()));
        }
    }

    /// Closes every connection and cancels pending reconnects. Never fails.
    pub async fn disconnect(&mut self) {
        self.shutdown.send_replace(true);
        for (channel, handle) in self.tasks.drain() {
            if let Err(e) = handle.await {
                tracing::warn!(channel = %channel, error = %e, "feed task ended abnormally");
            }
        }
        for status in self.status.values() {
            status.send_replace(false);
        }
    }

    pub fn is_connected(&self, channel: Channel) -> bool {
        self.status.get(&channel).is_some_and(|s| *s.borrow())
    }

    /// True only when every configured channel is up.
    pub fn connected(&self) -> bool {
        !self.status.is_empty() && self.status.values().all(|s| *s.borrow())
    }

    pub fn watch(&self, channel: Channel) -> Option<watch::Receiver<bool>> {
        self.status.get(&channel).map(|s| s.subscribe())
    }

    pub fn channels(&self) -> &[Channel] {
        &self.config.channels
    }
}

struct ChannelTask {
    channel: Channel,
    transport: Arc<dyn Transport>,
    delay: Duration,
    events: mpsc::Sender<FeedEvent>,
    status: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<Stats>,
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    // a dropped sender counts as shutdown too
    let _ = rx.wait_for(|stop| *stop).await;
}

impl ChannelTask {
    async fn run(mut self) {
        let channel = self.channel;
        loop {
            let opened = tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => break,
                r = self.transport.open(channel) => r,
            };

            match opened {
                Ok(stream) => {
                    self.status.send_replace(true);
                    tracing::info!(channel = %channel, "feed connected");
                    if !self.emit(FeedEvent::Connection { channel, connected: true }).await {
                        break;
                    }
                    let reconnect = self.pump(stream).await;
                    self.status.send_replace(false);
                    if !reconnect {
                        break;
                    }
                    tracing::warn!(channel = %channel, "feed disconnected");
                    if !self.emit(FeedEvent::Connection { channel, connected: false }).await {
                        break;
                    }
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    tracing::warn!(channel = %channel, error = %error, "feed connect failed");
                }
            }

            self.stats.inc_reconnect();
            let delay_ms = self.delay.as_millis() as u64;
            tracing::info!(channel = %channel, delay_ms, "reconnect scheduled");
            tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.status.send_replace(false);
        tracing::info!(channel = %channel, "feed channel stopped");
    }

    /// Forwards frames until the stream drops. Returns false when the task should stop for good.
    async fn pump(&mut self, mut stream: MessageStream) -> bool {
        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => return false,
                m = stream.next() => m,
            };
            match next {
                Some(Ok(text)) => {
                    if let Some(ev) = self.decode(&text) {
                        if !self.emit(ev).await {
                            return false;
                        }
                    }
                }
                Some(Err(e)) => {
                    let error = format!("{:#}", e);
                    tracing::warn!(channel = %self.channel, error = %error, "feed stream error");
                    return true;
                }
                None => return true,
            }
        }
    }

    fn decode(&self, text: &str) -> Option<FeedEvent> {
        let parsed = match self.channel {
            Channel::Trades => parse_trade(text).map(FeedEvent::Tick),
            Channel::Depth => parse_depth(text).map(FeedEvent::Depth),
        };
        match parsed {
            Ok(ev) => Some(ev),
            Err(e) => {
                self.stats.inc_dropped();
                tracing::debug!(channel = %self.channel, error = %e, "market message dropped");
                None
            }
        }
    }

    /// False once the engine side of the queue is gone or shutdown was requested.
    async fn emit(&mut self, ev: FeedEvent) -> bool {
        tokio::select! {
            biased;
            _ = stopped(&mut self.shutdown) => false,
            sent = self.events.send(ev) => sent.is_ok(),
        }
    }
}
