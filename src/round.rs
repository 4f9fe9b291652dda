use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::payout::{payout_for, round_payout};
use crate::selection::SelectionManager;
use crate::types::{Cell, CellKey, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTimings {
    pub betting_ms: i64,
    pub live_ms: i64,
    pub result_ms: i64,
}

impl RoundTimings {
    pub fn duration_of(&self, phase: Phase) -> i64 {
        match phase {
            Phase::Betting => self.betting_ms,
            Phase::Live => self.live_ms,
            Phase::Result => self.result_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockedBet {
    pub cell: Cell,
    pub hit_at_ms: Option<i64>,
    pub hit_price: Option<Decimal>,
}

impl LockedBet {
    pub fn is_hit(&self) -> bool {
        self.hit_at_ms.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Round {
    pub id: u64,
    pub phase: Phase,
    pub phase_started_ms: i64,
    pub phase_deadline_ms: i64,
    pub stake: Decimal,
    /// Empty while betting; frozen from the lock until the round is discarded.
    pub locked_bets: Vec<LockedBet>,
    /// Zero when no price was known at lock.
    pub reference_lock_price: Decimal,
    pub payout: Decimal,
}

impl Round {
    fn betting(id: u64, started_ms: i64, timings: &RoundTimings) -> Self {
        Self {
            id,
            phase: Phase::Betting,
            phase_started_ms: started_ms,
            phase_deadline_ms: started_ms + timings.betting_ms,
            stake: Decimal::ZERO,
            locked_bets: Vec::new(),
            reference_lock_price: Decimal::ZERO,
            payout: Decimal::ZERO,
        }
    }

    fn enter(&mut self, phase: Phase, at_ms: i64, timings: &RoundTimings) {
        self.phase = phase;
        self.phase_started_ms = at_ms;
        self.phase_deadline_ms = at_ms + timings.duration_of(phase);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BetOutcome {
    pub cell: Cell,
    pub won: bool,
    pub payout: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundOutcome {
    pub round_id: u64,
    pub stake: Decimal,
    pub lock_price: Decimal,
    pub bets: Vec<BetOutcome>,
    pub payout: Decimal,
    pub resolved_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    Locked {
        round_id: u64,
        lock_price: Decimal,
        stake: Decimal,
        bets: Vec<Cell>,
        deadline_ms: i64,
    },
    Hit { round_id: u64, cell: CellKey, price: Decimal, payout: Decimal },
    Resolved { outcome: RoundOutcome, deadline_ms: i64 },
    Started { round_id: u64, deadline_ms: i64 },
}

/// Betting -> Live -> Result -> Betting, driven by a logical millisecond clock.
#[derive(Debug)]
pub struct RoundStateMachine {
    timings: RoundTimings,
    round: Round,
    history: VecDeque<RoundOutcome>,
    history_cap: usize,
}

impl RoundStateMachine {
    pub fn new(timings: RoundTimings, history_cap: usize, now_ms: i64) -> Self {
        Self {
            timings,
            round: Round::betting(1, now_ms, &timings),
            history: VecDeque::with_capacity(history_cap),
            history_cap,
        }
    }

    /// Applies every phase deadline that is due at `now_ms`, in order. Deadlines chain off
    /// the previous deadline rather than `now_ms`, so a late call does not stretch the schedule.
    pub fn advance(
        &mut self,
        now_ms: i64,
        selection: &mut SelectionManager,
        live_price: Decimal,
        stake: Decimal,
    ) -> Vec<RoundEvent> {
        let mut events = Vec::new();
        while now_ms >= self.round.phase_deadline_ms {
            let at = self.round.phase_deadline_ms;
            match self.round.phase {
                Phase::Betting => {
                    events.push(self.lock(at, selection.snapshot(), live_price, stake))
                }
                Phase::Live => events.push(self.resolve(at)),
                Phase::Result => {
                    selection.clear();
                    events.push(self.next_round(at));
                }
            }
        }
        events
    }

    fn lock(
        &mut self,
        at_ms: i64,
        cells: Vec<Cell>,
        live_price: Decimal,
        stake: Decimal,
    ) -> RoundEvent {
        let timings = self.timings;
        let r = &mut self.round;
        r.stake = stake;
        r.reference_lock_price = live_price.max(Decimal::ZERO);
        r.payout = Decimal::ZERO;
        r.locked_bets = cells
            .into_iter()
            .map(|cell| LockedBet { cell, hit_at_ms: None, hit_price: None })
            .collect();
        r.enter(Phase::Live, at_ms, &timings);

        tracing::info!(
            round_id = r.id,
            bets = r.locked_bets.len(),
            lock_price = %r.reference_lock_price,
            stake = %r.stake,
            "round locked"
        );
        RoundEvent::Locked {
            round_id: r.id,
            lock_price: r.reference_lock_price,
            stake: r.stake,
            bets: r.locked_bets.iter().map(|b| b.cell.clone()).collect(),
            deadline_ms: r.phase_deadline_ms,
        }
    }

    fn resolve(&mut self, at_ms: i64) -> RoundEvent {
        let timings = self.timings;
        let r = &mut self.round;
        r.enter(Phase::Result, at_ms, &timings);

        let bets = r
            .locked_bets
            .iter()
            .map(|b| BetOutcome {
                cell: b.cell.clone(),
                won: b.is_hit(),
                payout: if b.is_hit() {
                    payout_for(r.stake, b.cell.multiplier_bps)
                } else {
                    Decimal::ZERO
                },
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(
            round_payout(
                r.stake,
                r.locked_bets.iter().map(|b| (b.cell.multiplier_bps, b.is_hit()))
            ),
            r.payout
        );
        let outcome = RoundOutcome {
            round_id: r.id,
            stake: r.stake,
            lock_price: r.reference_lock_price,
            payout: r.payout,
            bets,
            resolved_at_ms: at_ms,
        };

        tracing::info!(
            round_id = r.id,
            payout = %r.payout,
            won = outcome.bets.iter().filter(|b| b.won).count(),
            lost = outcome.bets.iter().filter(|b| !b.won).count(),
            "round resolved"
        );

        if self.history_cap > 0 {
            while self.history.len() >= self.history_cap {
                self.history.pop_front();
            }
            self.history.push_back(outcome.clone());
        }
        RoundEvent::Resolved { outcome, deadline_ms: self.round.phase_deadline_ms }
    }

    fn next_round(&mut self, at_ms: i64) -> RoundEvent {
        self.round = Round::betting(self.round.id + 1, at_ms, &self.timings);
        tracing::info!(round_id = self.round.id, "round started");
        RoundEvent::Started { round_id: self.round.id, deadline_ms: self.round.phase_deadline_ms }
    }

    /// Hit detection against a live trade. Each bet pays at most once.
    pub fn on_price(&mut self, price: Decimal, at_ms: i64) -> Vec<RoundEvent> {
        let r = &mut self.round;
        if r.phase != Phase::Live || price <= Decimal::ZERO {
            return Vec::new();
        }
        let mut events = Vec::new();
        for bet in r.locked_bets.iter_mut().filter(|b| !b.is_hit()) {
            if !bet.cell.is_hit_by(price) {
                continue;
            }
            bet.hit_at_ms = Some(at_ms);
            bet.hit_price = Some(price);
            let won = payout_for(r.stake, bet.cell.multiplier_bps);
            r.payout += won;
            tracing::info!(
                round_id = r.id,
                cell = %bet.cell.id,
                price = %price,
                payout = %won,
                "bet hit"
            );
            events.push(RoundEvent::Hit { round_id: r.id, cell: bet.cell.id, price, payout: won });
        }
        events
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn phase(&self) -> Phase {
        self.round.phase
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.round.phase_deadline_ms - now_ms).max(0)
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RoundOutcome> {
        self.history.iter()
    }

    pub fn timings(&self) -> &RoundTimings {
        &self.timings
    }
}
