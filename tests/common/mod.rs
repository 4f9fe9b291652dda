#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::sync::mpsc;

use gridbet::feed::{Channel, FeedConfig, FeedEvent, MarketFeed, MessageStream, Transport};
use gridbet::stats::Stats;

/// In-memory transport: every open hands out a fresh stream the test can feed or cut.
#[derive(Default)]
pub struct FakeTransport {
    links: Mutex<HashMap<Channel, UnboundedSender<anyhow::Result<String>>>>,
    opens: Mutex<HashMap<Channel, usize>>,
    attempts: AtomicUsize,
    fail_opens: AtomicUsize,
}

impl FakeTransport {
    pub fn failing_first(n: usize) -> Self {
        let t = Self::default();
        t.fail_opens.store(n, Ordering::SeqCst);
        t
    }

    pub fn opens(&self, channel: Channel) -> usize {
        self.opens.lock().unwrap().get(&channel).copied().unwrap_or(0)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn has_link(&self, channel: Channel) -> bool {
        self.links.lock().unwrap().contains_key(&channel)
    }

    pub fn push(&self, channel: Channel, text: &str) -> bool {
        self.links
            .lock()
            .unwrap()
            .get(&channel)
            .map(|tx| tx.unbounded_send(Ok(text.to_string())).is_ok())
            .unwrap_or(false)
    }

    /// Ends the current stream as if the server hung up.
    pub fn cut(&self, channel: Channel) {
        self.links.lock().unwrap().remove(&channel);
    }

    /// True when nobody is reading the current stream any more.
    pub fn link_closed(&self, channel: Channel) -> bool {
        self.links.lock().unwrap().get(&channel).map_or(true, |tx| tx.is_closed())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, channel: Channel) -> anyhow::Result<MessageStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("connection refused");
        }
        let (tx, rx) = unbounded();
        self.links.lock().unwrap().insert(channel, tx);
        *self.opens.lock().unwrap().entry(channel).or_default() += 1;
        Ok(rx.boxed())
    }
}

pub fn feed_config(channels: &[Channel]) -> FeedConfig {
    FeedConfig { channels: channels.to_vec(), reconnect_delay: Duration::from_millis(2000) }
}

pub fn new_feed(
    channels: &[Channel],
    transport: &Arc<FakeTransport>,
    stats: &Arc<Stats>,
) -> (MarketFeed, mpsc::Receiver<FeedEvent>) {
    MarketFeed::new(feed_config(channels), transport.clone(), stats.clone())
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
