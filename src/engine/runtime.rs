use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::core::{EngineCommand, EngineCore, EngineSnapshot, EngineUpdate, Step};
use crate::config::EngineConfig;
use crate::feed::{FeedEvent, MarketFeed};
use crate::settlement::{Confirmation, SettlementClient, SettlementError};
use crate::stats::Stats;

const COMMAND_BUFFER: usize = 64;
const UPDATE_BUFFER: usize = 1024;

/// Wall clock anchored once, advanced by tokio's clock so paused-time tests stay deterministic.
#[derive(Debug, Clone, Copy)]
struct Clock {
    epoch_ms: i64,
    started: Instant,
}

impl Clock {
    fn new() -> Self {
        Self { epoch_ms: chrono::Utc::now().timestamp_millis(), started: Instant::now() }
    }

    fn now_ms(&self) -> i64 {
        self.epoch_ms + self.started.elapsed().as_millis() as i64
    }
}

pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    updates: broadcast::Sender<EngineUpdate>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn commands(&self) -> mpsc::Sender<EngineCommand> {
        self.commands.clone()
    }

    pub async fn send(&self, cmd: EngineCommand) -> anyhow::Result<()> {
        self.commands.send(cmd).await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> anyhow::Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { reply }).await?;
        rx.await.context("engine dropped snapshot request")
    }

    /// Closes the feed (pending reconnects included), aborts in-flight submissions and
    /// waits for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "engine task ended abnormally");
        }
    }
}

/// Connects the feed and spawns the single task that owns all engine state.
pub fn start_engine(
    config: EngineConfig,
    mut feed: MarketFeed,
    feed_events: mpsc::Receiver<FeedEvent>,
    settlement: Arc<dyn SettlementClient>,
    stats: Arc<Stats>,
) -> EngineHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (updates, _) = broadcast::channel(UPDATE_BUFFER);
    let (shutdown, shutdown_rx) = oneshot::channel();

    let clock = Clock::new();
    feed.connect();

    let runtime = EngineRuntime {
        timer_tick: config.timer_tick,
        core: EngineCore::new(config, clock.now_ms()).with_channels(feed.channels()),
        clock,
        feed,
        feed_events,
        commands: command_rx,
        updates: updates.clone(),
        settlement,
        inflight: JoinSet::new(),
        stats,
    };
    let task = tokio::spawn(runtime.run(shutdown_rx));

    EngineHandle { commands, updates, shutdown, task }
}

type SubmissionResult = (u64, Result<Confirmation, SettlementError>);

struct EngineRuntime {
    core: EngineCore,
    clock: Clock,
    timer_tick: std::time::Duration,
    feed: MarketFeed,
    feed_events: mpsc::Receiver<FeedEvent>,
    commands: mpsc::Receiver<EngineCommand>,
    updates: broadcast::Sender<EngineUpdate>,
    settlement: Arc<dyn SettlementClient>,
    inflight: JoinSet<SubmissionResult>,
    stats: Arc<Stats>,
}

impl EngineRuntime {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut timer = tokio::time::interval(self.timer_tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;
        tracing::info!(channels = ?self.feed.channels(), "engine started");

        loop {
            tokio::select! {
                biased;
                // a dropped handle also stops the engine
                _ = &mut shutdown => break,
                _ = timer.tick() => {
                    let step = self.core.on_timer(self.clock.now_ms());
                    self.dispatch(step);
                }
                Some(done) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    match done {
                        Ok((round_id, result)) => {
                            self.stats.inc_submission(result.is_ok());
                            let now = self.clock.now_ms();
                            let step = self.core.on_submission_result(now, round_id, result);
                            self.dispatch(step);
                        }
                        Err(e) => tracing::warn!(error = %e, "submission task failed"),
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        let step = self.core.on_command(self.clock.now_ms(), cmd);
                        self.dispatch(step);
                    }
                    None => break,
                },
                ev = self.feed_events.recv(), if feed_open => match ev {
                    Some(ev) => self.on_feed(ev),
                    None => {
                        tracing::warn!("feed event queue closed");
                        feed_open = false;
                    }
                },
            }
        }

        self.inflight.abort_all();
        // unblocks feed tasks stuck on a full queue
        self.feed_events.close();
        self.feed.disconnect().await;
        tracing::info!(round_id = self.core.round().id, "engine stopped");
    }

    fn on_feed(&mut self, ev: FeedEvent) {
        let now = self.clock.now_ms();
        let step = match ev {
            FeedEvent::Tick(tick) => {
                self.stats.inc_tick();
                self.core.on_tick(now, tick)
            }
            FeedEvent::Depth(depth) => {
                self.stats.inc_depth();
                self.core.on_depth(now, depth)
            }
            FeedEvent::Connection { channel, connected } => {
                self.core.on_connection(now, channel, connected)
            }
        };
        self.dispatch(step);
    }

    fn dispatch(&mut self, step: Step) {
        for sub in step.submissions {
            let client = self.settlement.clone();
            self.inflight.spawn(async move {
                let result = client.submit(&sub.bet).await;
                (sub.round_id, result)
            });
        }
        for update in step.updates {
            self.record(&update);
            // no subscribers is fine
            let _ = self.updates.send(update);
        }
    }

    fn record(&self, update: &EngineUpdate) {
        match update {
            EngineUpdate::GridRegenerated { .. } => self.stats.inc_grid_regen(),
            EngineUpdate::Locked { bets, .. } => self.stats.add_bets_locked(bets.len() as u64),
            EngineUpdate::Hit { .. } => self.stats.inc_hit(),
            EngineUpdate::Resolved { .. } => self.stats.inc_round_completed(),
            _ => {}
        }
    }
}
