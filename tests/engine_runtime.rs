mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;

use common::{new_feed, wait_until, FakeTransport};
use gridbet::config::EngineConfig;
use gridbet::engine::{
    start_engine, EngineCommand, EngineHandle, EngineSnapshot, EngineUpdate, SubmissionState,
};
use gridbet::feed::Channel;
use gridbet::settlement::{Bet, Confirmation, SettlementClient, SettlementError};
use gridbet::stats::Stats;
use gridbet::types::{Phase, Side};

struct Rejecting;

#[async_trait]
impl SettlementClient for Rejecting {
    async fn submit(&self, _bet: &Bet) -> Result<Confirmation, SettlementError> {
        Err(SettlementError::Rejected("insufficient funds".into()))
    }
}

/// Confirms after a delay so the test can watch the engine while the call is pending.
#[derive(Default)]
struct Slow {
    calls: AtomicUsize,
}

#[async_trait]
impl SettlementClient for Slow {
    async fn submit(&self, bet: &Bet) -> Result<Confirmation, SettlementError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Confirmation(format!("sig-{}", bet.round_id)))
    }
}

struct Harness {
    engine: EngineHandle,
    transport: Arc<FakeTransport>,
    stats: Arc<Stats>,
}

async fn boot(settlement: Arc<dyn SettlementClient>) -> Harness {
    let transport = Arc::new(FakeTransport::default());
    let stats = Stats::new(0);
    let (feed, events) = new_feed(&[Channel::Trades], &transport, &stats);
    let engine = start_engine(EngineConfig::default(), feed, events, settlement, stats.clone());

    let t = transport.clone();
    wait_until(move || t.has_link(Channel::Trades)).await;
    transport.push(Channel::Trades, r#"{"p":"100","T":1}"#);
    wait_for_snapshot(&engine, |s| s.connected && !s.cells.is_empty()).await;

    Harness { engine, transport, stats }
}

async fn wait_for_snapshot(
    engine: &EngineHandle,
    cond: impl Fn(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    for _ in 0..200 {
        let snap = engine.snapshot().await.unwrap();
        if cond(&snap) {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("engine never reached the expected state");
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<EngineUpdate>, f: F) -> EngineUpdate
where
    F: Fn(&EngineUpdate) -> bool,
{
    loop {
        let u = tokio::time::timeout(Duration::from_secs(120), rx.recv()).await.unwrap().unwrap();
        if f(&u) {
            return u;
        }
    }
}

async fn pick_first_above(engine: &EngineHandle) {
    let snap = engine.snapshot().await.unwrap();
    let key = snap.cells.iter().find(|c| c.side == Side::Above).unwrap().id;
    engine.send(EngineCommand::Toggle(key)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rejected_bet_keeps_selection() {
    let h = boot(Arc::new(Rejecting)).await;
    let mut updates = h.engine.subscribe();

    pick_first_above(&h.engine).await;
    h.engine.send(EngineCommand::Confirm).await.unwrap();

    let failed =
        next_matching(&mut updates, |u| matches!(u, EngineUpdate::SubmissionFailed { .. })).await;
    let EngineUpdate::SubmissionFailed { round_id, reason } = failed else { unreachable!() };
    assert_eq!(round_id, 1);
    assert!(reason.contains("insufficient funds"), "{}", reason);

    let snap = h.engine.snapshot().await.unwrap();
    assert_eq!(snap.selection.len(), 1);
    assert_eq!(snap.submission, SubmissionState::Idle);
    assert_eq!(h.stats.snapshot(0).submissions_failed, 1);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn engine_keeps_running_while_submission_pending() {
    let slow = Arc::new(Slow::default());
    let h = boot(slow.clone()).await;
    let mut updates = h.engine.subscribe();

    pick_first_above(&h.engine).await;
    h.engine.send(EngineCommand::Confirm).await.unwrap();
    next_matching(&mut updates, |u| matches!(u, EngineUpdate::SubmissionStarted { .. })).await;

    h.transport.push(Channel::Trades, r#"{"p":"100.01","T":2}"#);
    let snap = wait_for_snapshot(&h.engine, |s| s.last_price == dec!(100.01)).await;
    assert_eq!(snap.submission, SubmissionState::InFlight { round_id: 1 });

    let confirmed =
        next_matching(&mut updates, |u| matches!(u, EngineUpdate::SubmissionConfirmed { .. }))
            .await;
    assert!(matches!(confirmed, EngineUpdate::SubmissionConfirmed { round_id: 1, .. }));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

    // accepted bets freeze the selection
    h.engine.send(EngineCommand::ClearSelection).await.unwrap();
    let snap = h.engine.snapshot().await.unwrap();
    assert_eq!(snap.selection.len(), 1);
    assert!(matches!(snap.submission, SubmissionState::Accepted { round_id: 1, .. }));

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rounds_advance_on_the_timer() {
    let h = boot(Arc::new(Rejecting)).await;
    let mut updates = h.engine.subscribe();

    let locked = next_matching(&mut updates, |u| matches!(u, EngineUpdate::Locked { .. })).await;
    assert!(matches!(locked, EngineUpdate::Locked { round_id: 1, .. }));
    next_matching(&mut updates, |u| matches!(u, EngineUpdate::Resolved { .. })).await;
    next_matching(&mut updates, |u| {
        matches!(u, EngineUpdate::RoundStarted { round_id: 2, .. })
    })
    .await;

    let snap = h.engine.snapshot().await.unwrap();
    assert_eq!(snap.round.id, 2);
    assert_eq!(snap.round.phase, Phase::Betting);
    assert_eq!(snap.history.len(), 1);
    assert_eq!(h.stats.snapshot(0).rounds_completed, 1);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn confirm_waits_for_a_channel_that_never_came_up() {
    // whichever channel opens first is refused once and retries after the delay
    let transport = Arc::new(FakeTransport::failing_first(1));
    let stats = Stats::new(0);
    let (feed, events) = new_feed(&[Channel::Trades, Channel::Depth], &transport, &stats);
    let slow = Arc::new(Slow::default());
    let engine = start_engine(EngineConfig::default(), feed, events, slow.clone(), stats);
    let mut updates = engine.subscribe();

    let t = transport.clone();
    wait_until(move || t.has_link(Channel::Trades) || t.has_link(Channel::Depth)).await;
    if transport.has_link(Channel::Trades) {
        transport.push(Channel::Trades, r#"{"p":"100","T":1}"#);
    } else {
        let depth = r#"{"lastUpdateId":1,"bids":[["99.99","1"]],"asks":[["100.01","1"]]}"#;
        transport.push(Channel::Depth, depth);
    }
    let snap = wait_for_snapshot(&engine, |s| !s.cells.is_empty()).await;
    assert!(!snap.connected);

    pick_first_above(&engine).await;
    engine.send(EngineCommand::Confirm).await.unwrap();
    let refused =
        next_matching(&mut updates, |u| matches!(u, EngineUpdate::SubmissionFailed { .. })).await;
    let EngineUpdate::SubmissionFailed { reason, .. } = refused else { unreachable!() };
    assert_eq!(reason, "market feed is disconnected");
    assert_eq!(slow.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let snap = wait_for_snapshot(&engine, |s| s.connected).await;
    assert_eq!(snap.round.phase, Phase::Betting);
    assert_eq!(snap.selection.len(), 1);

    engine.send(EngineCommand::Confirm).await.unwrap();
    next_matching(&mut updates, |u| matches!(u, EngineUpdate::SubmissionStarted { .. })).await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_feed_and_stops_reconnects() {
    let h = boot(Arc::new(Rejecting)).await;
    let transport = h.transport.clone();

    h.engine.shutdown().await;
    assert!(transport.link_closed(Channel::Trades));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.opens(Channel::Trades), 1);
}
