use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counters, shared by the feed tasks and the engine loop.
#[derive(Default)]
pub struct Stats {
    start_ms: AtomicU64,
    last_log_ms: AtomicU64,

    ticks: AtomicU64,
    depth_updates: AtomicU64,
    dropped_messages: AtomicU64,
    reconnects: AtomicU64,

    grid_regenerations: AtomicU64,
    rounds_completed: AtomicU64,
    bets_locked: AtomicU64,
    hits: AtomicU64,

    submissions_ok: AtomicU64,
    submissions_failed: AtomicU64,
}

impl Stats {
    pub fn new(now_ms: u64) -> Arc<Self> {
        let s = Arc::new(Self::default());
        s.start_ms.store(now_ms, Ordering::Relaxed);
        s.last_log_ms.store(now_ms, Ordering::Relaxed);
        s
    }

    pub fn inc_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_depth(&self) {
        self.depth_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_grid_regen(&self) {
        self.grid_regenerations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_round_completed(&self) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bets_locked(&self, n: u64) {
        self.bets_locked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submission(&self, ok: bool) {
        let c = if ok { &self.submissions_ok } else { &self.submissions_failed };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub fn should_log(&self, now_ms: u64, every_sec: u64) -> bool {
        if every_sec == 0 { return false; }
        let last = self.last_log_ms.load(Ordering::Relaxed);
        now_ms.saturating_sub(last) >= every_sec.saturating_mul(1000)
    }

    pub fn mark_logged(&self, now_ms: u64) {
        self.last_log_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_ms: u64) -> StatsSnapshot {
        let start = self.start_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            now_ms,
            up_sec: now_ms.saturating_sub(start) / 1000,
            ticks: self.ticks.load(Ordering::Relaxed),
            depth_updates: self.depth_updates.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            grid_regenerations: self.grid_regenerations.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            bets_locked: self.bets_locked.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            submissions_ok: self.submissions_ok.load(Ordering::Relaxed),
            submissions_failed: self.submissions_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub now_ms: u64,
    pub up_sec: u64,
    pub ticks: u64,
    pub depth_updates: u64,
    pub dropped_messages: u64,
    pub reconnects: u64,
    pub grid_regenerations: u64,
    pub rounds_completed: u64,
    pub bets_locked: u64,
    pub hits: u64,
    pub submissions_ok: u64,
    pub submissions_failed: u64,
}
