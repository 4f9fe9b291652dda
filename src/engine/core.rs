use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::book::OrderBookAggregator;
use crate::config::EngineConfig;
use crate::feed::Channel;
use crate::grid::Grid;
use crate::round::{Round, RoundEvent, RoundOutcome, RoundStateMachine};
use crate::selection::{SelectionManager, Toggle};
use crate::settlement::{ledger_round_id, Bet, BetRules, Confirmation, SettlementError};
use crate::types::{BookSide, Cell, CellKey, Direction, OrderLevel, Phase, PriceTick, RawDepth};

/// Player input. Anything not allowed in the current state is a logged no-op.
#[derive(Debug)]
pub enum EngineCommand {
    Toggle(CellKey),
    ClearSelection,
    SetStake(Decimal),
    /// Seconds; must be one of the configured windows.
    SetTimeWindow(u64),
    Confirm,
    Snapshot { reply: oneshot::Sender<EngineSnapshot> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmError {
    #[error("betting is closed for this round")]
    BettingClosed,
    #[error("no cells selected")]
    NoSelection,
    #[error("a bet was already submitted this round")]
    AlreadySubmitted,
    #[error("market feed is disconnected")]
    FeedDisconnected,
    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineUpdate {
    Connection { channel: Channel, connected: bool, all_connected: bool },
    GridRegenerated { generation: u64, reference: Decimal, cells: usize },
    SelectionChanged { selected: Vec<CellKey>, max_payout: Decimal },
    StakeChanged { stake: Decimal },
    TimeWindowChanged { secs: u64 },
    Countdown { round_id: u64, phase: Phase, remaining_ms: i64 },
    Locked { round_id: u64, lock_price: Decimal, stake: Decimal, bets: Vec<Cell> },
    Hit { round_id: u64, cell: CellKey, price: Decimal, payout: Decimal },
    Resolved { outcome: RoundOutcome },
    RoundStarted { round_id: u64, deadline_ms: i64 },
    SubmissionStarted { round_id: u64, ledger_round_id: u64, zones: usize },
    SubmissionConfirmed { round_id: u64, confirmation: String },
    SubmissionFailed { round_id: u64, reason: String },
}

/// A bet the runtime has to hand to the settlement client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub round_id: u64,
    pub bet: Bet,
}

/// Output of one engine entry point.
#[derive(Debug, Default)]
pub struct Step {
    pub updates: Vec<EngineUpdate>,
    pub submissions: Vec<Submission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    Idle,
    InFlight { round_id: u64 },
    Accepted { round_id: u64, confirmation: String },
}

impl SubmissionState {
    /// Selection and stake are frozen unless idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, SubmissionState::Idle)
    }
}

/// Headless read model of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub now_ms: i64,
    pub round: Round,
    pub remaining_ms: i64,
    pub last_price: Decimal,
    pub direction: Direction,
    pub mid_price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub spread: Decimal,
    pub bid_walls: Vec<OrderLevel>,
    pub ask_walls: Vec<OrderLevel>,
    pub grid_reference: Decimal,
    pub grid_generation: u64,
    pub cells: Vec<Cell>,
    pub selection: Vec<Cell>,
    pub stake: Decimal,
    pub max_payout: Decimal,
    pub time_window_secs: u64,
    pub connected: bool,
    pub submission: SubmissionState,
    pub history: Vec<RoundOutcome>,
}

/// Owns book, grid, selection and round. Every entry point first brings the round
/// schedule up to `now_ms`, then applies its event, so an event never sees a phase
/// whose deadline already passed.
pub struct EngineCore {
    config: EngineConfig,
    session_started_ms: i64,
    book: OrderBookAggregator,
    grid: Grid,
    selection: SelectionManager,
    round: RoundStateMachine,
    stake: Decimal,
    time_window_secs: u64,
    connections: BTreeMap<Channel, bool>,
    submission: SubmissionState,
}

impl EngineCore {
    pub fn new(config: EngineConfig, now_ms: i64) -> Self {
        tracing::info!(
            betting_ms = config.timings.betting_ms,
            live_ms = config.timings.live_ms,
            result_ms = config.timings.result_ms,
            max_selections = config.max_selections,
            "engine created"
        );
        Self {
            session_started_ms: now_ms,
            book: OrderBookAggregator::new(),
            grid: Grid::new(config.grid.clone()),
            selection: SelectionManager::new(config.max_selections),
            round: RoundStateMachine::new(config.timings, config.history_cap, now_ms),
            stake: config.default_stake,
            time_window_secs: config.default_time_window,
            connections: BTreeMap::new(),
            submission: SubmissionState::Idle,
            config,
        }
    }

    /// Channels that must all be up before the feed counts as connected.
    pub fn with_channels(mut self, channels: &[Channel]) -> Self {
        for channel in channels {
            self.connections.entry(*channel).or_insert(false);
        }
        self
    }

    pub fn on_timer(&mut self, now_ms: i64) -> Step {
        let mut step = self.advance(now_ms);
        let r = self.round.round();
        step.updates.push(EngineUpdate::Countdown {
            round_id: r.id,
            phase: r.phase,
            remaining_ms: self.round.remaining_ms(now_ms),
        });
        step
    }

    pub fn on_tick(&mut self, now_ms: i64, tick: PriceTick) -> Step {
        let mut step = self.advance(now_ms);
        if tick.price <= Decimal::ZERO {
            return step;
        }
        self.book.apply_trade(tick);
        for ev in self.round.on_price(tick.price, now_ms) {
            self.push_round_event(ev, &mut step);
        }
        self.refresh_grid(&mut step);
        step
    }

    pub fn on_depth(&mut self, now_ms: i64, depth: RawDepth) -> Step {
        let mut step = self.advance(now_ms);
        if self.book.apply_depth_snapshot(depth) {
            self.refresh_grid(&mut step);
        }
        step
    }

    pub fn on_connection(&mut self, now_ms: i64, channel: Channel, connected: bool) -> Step {
        let mut step = self.advance(now_ms);
        self.connections.insert(channel, connected);
        let all_connected = self.connected();
        step.updates.push(EngineUpdate::Connection { channel, connected, all_connected });
        step
    }

    pub fn on_command(&mut self, now_ms: i64, cmd: EngineCommand) -> Step {
        let mut step = self.advance(now_ms);
        match cmd {
            EngineCommand::Toggle(key) => self.toggle(key, &mut step),
            EngineCommand::ClearSelection => {
                if self.selection_locked("clear") || self.selection.is_empty() {
                    return step;
                }
                self.selection.clear();
                self.push_selection(&mut step);
            }
            EngineCommand::SetStake(stake) => {
                if self.selection_locked("stake") {
                    return step;
                }
                if !self.config.bet_presets.contains(&stake) {
                    tracing::debug!(stake = %stake, "stake is not a preset, ignored");
                    return step;
                }
                if stake != self.stake {
                    self.stake = stake;
                    step.updates.push(EngineUpdate::StakeChanged { stake });
                    self.push_selection(&mut step);
                }
            }
            EngineCommand::SetTimeWindow(secs) => self.set_time_window(secs, &mut step),
            EngineCommand::Confirm => {
                let round_id = self.round.round().id;
                match self.confirm() {
                    Ok(sub) => self.start_submission(sub, &mut step),
                    Err(e) => {
                        tracing::warn!(round_id, error = %e, "confirm refused");
                        let reason = e.to_string();
                        step.updates.push(EngineUpdate::SubmissionFailed { round_id, reason });
                    }
                }
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(now_ms));
            }
        }
        step
    }

    /// Completion of a submission the runtime started. Results for an earlier round only
    /// produce an update; they never touch the current round's state.
    pub fn on_submission_result(
        &mut self,
        now_ms: i64,
        round_id: u64,
        result: Result<Confirmation, SettlementError>,
    ) -> Step {
        let mut step = self.advance(now_ms);
        let current =
            matches!(self.submission, SubmissionState::InFlight { round_id: r } if r == round_id);
        match result {
            Ok(confirmation) => {
                tracing::info!(round_id, confirmation = %confirmation, "bet confirmed");
                if current {
                    let confirmation = confirmation.0.clone();
                    self.submission = SubmissionState::Accepted { round_id, confirmation };
                }
                let confirmation = confirmation.0;
                step.updates.push(EngineUpdate::SubmissionConfirmed { round_id, confirmation });
            }
            Err(e) => {
                tracing::warn!(round_id, error = %e, "bet submission failed");
                if current {
                    self.submission = SubmissionState::Idle;
                }
                let reason = e.to_string();
                step.updates.push(EngineUpdate::SubmissionFailed { round_id, reason });
            }
        }
        if !current {
            tracing::debug!(
                round_id,
                current_round = self.round.round().id,
                "settlement result for a past round"
            );
        }
        step
    }

    pub fn snapshot(&self, now_ms: i64) -> EngineSnapshot {
        let book = self.book.snapshot();
        EngineSnapshot {
            now_ms,
            round: self.round.round().clone(),
            remaining_ms: self.round.remaining_ms(now_ms),
            last_price: self.book.last_price(),
            direction: self.book.direction(),
            mid_price: book.mid_price,
            best_bid: book.best_bid,
            best_ask: book.best_ask,
            spread: book.spread,
            bid_walls: self.book.walls(BookSide::Bid).into_iter().cloned().collect(),
            ask_walls: self.book.walls(BookSide::Ask).into_iter().cloned().collect(),
            grid_reference: self.grid.reference(),
            grid_generation: self.grid.generation(),
            cells: self.grid.cells().to_vec(),
            selection: self.selection.snapshot(),
            stake: self.stake,
            max_payout: self.selection.max_payout(self.stake),
            time_window_secs: self.time_window_secs,
            connected: self.connected(),
            submission: self.submission.clone(),
            history: self.round.history().cloned().collect(),
        }
    }

    /// True once every expected channel (and any other that reported in) is up.
    pub fn connected(&self) -> bool {
        !self.connections.is_empty() && self.connections.values().all(|c| *c)
    }

    pub fn round(&self) -> &Round {
        self.round.round()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn book(&self) -> &OrderBookAggregator {
        &self.book
    }

    pub fn selection(&self) -> &SelectionManager {
        &self.selection
    }

    pub fn stake(&self) -> Decimal {
        self.stake
    }

    pub fn time_window_secs(&self) -> u64 {
        self.time_window_secs
    }

    pub fn submission(&self) -> &SubmissionState {
        &self.submission
    }

    pub fn history(&self) -> impl Iterator<Item = &RoundOutcome> {
        self.round.history()
    }

    pub fn bet_rules(&self) -> &BetRules {
        &self.config.bet_rules
    }

    fn advance(&mut self, now_ms: i64) -> Step {
        let mut step = Step::default();
        let live_price = self.book.reference_price();
        let events = self.round.advance(now_ms, &mut self.selection, live_price, self.stake);
        for ev in events {
            self.push_round_event(ev, &mut step);
        }
        step
    }

    fn push_round_event(&mut self, ev: RoundEvent, step: &mut Step) {
        match ev {
            RoundEvent::Locked { round_id, lock_price, stake, bets, .. } => {
                let auto = self.config.auto_submit_on_lock && self.submission.is_idle();
                if auto && !bets.is_empty() {
                    self.auto_submit(round_id, stake, &bets, step);
                }
                step.updates.push(EngineUpdate::Locked { round_id, lock_price, stake, bets });
            }
            RoundEvent::Hit { round_id, cell, price, payout } => {
                step.updates.push(EngineUpdate::Hit { round_id, cell, price, payout });
            }
            RoundEvent::Resolved { outcome, .. } => {
                step.updates.push(EngineUpdate::Resolved { outcome });
            }
            RoundEvent::Started { round_id, deadline_ms } => {
                self.submission = SubmissionState::Idle;
                step.updates.push(EngineUpdate::RoundStarted { round_id, deadline_ms });
                self.push_selection(step);
            }
        }
    }

    fn auto_submit(&mut self, round_id: u64, stake: Decimal, cells: &[Cell], step: &mut Step) {
        let ledger_id = ledger_round_id(self.session_started_ms, round_id);
        match Bet::from_cells(ledger_id, stake, cells, &self.config.bet_rules) {
            Ok(bet) => self.start_submission(Submission { round_id, bet }, step),
            Err(e) => {
                tracing::warn!(round_id, error = %e, "auto submit refused");
                let reason = e.to_string();
                step.updates.push(EngineUpdate::SubmissionFailed { round_id, reason });
            }
        }
    }

    fn confirm(&self) -> Result<Submission, ConfirmError> {
        let round = self.round.round();
        if round.phase != Phase::Betting {
            return Err(ConfirmError::BettingClosed);
        }
        if !self.submission.is_idle() {
            return Err(ConfirmError::AlreadySubmitted);
        }
        if self.selection.is_empty() {
            return Err(ConfirmError::NoSelection);
        }
        if !self.connected() {
            return Err(ConfirmError::FeedDisconnected);
        }
        let ledger_id = ledger_round_id(self.session_started_ms, round.id);
        let cells = self.selection.cells();
        let bet = Bet::from_cells(ledger_id, self.stake, cells, &self.config.bet_rules)?;
        Ok(Submission { round_id: round.id, bet })
    }

    fn start_submission(&mut self, sub: Submission, step: &mut Step) {
        tracing::info!(
            round_id = sub.round_id,
            ledger_round_id = sub.bet.round_id,
            stake_lamports = sub.bet.stake_lamports,
            zones = sub.bet.zones.len(),
            "bet submitted"
        );
        self.submission = SubmissionState::InFlight { round_id: sub.round_id };
        step.updates.push(EngineUpdate::SubmissionStarted {
            round_id: sub.round_id,
            ledger_round_id: sub.bet.round_id,
            zones: sub.bet.zones.len(),
        });
        step.submissions.push(sub);
    }

    fn toggle(&mut self, key: CellKey, step: &mut Step) {
        if self.round.phase() != Phase::Betting {
            tracing::debug!(
                cell = %key,
                phase = %self.round.phase(),
                "toggle outside betting ignored"
            );
            return;
        }
        if self.selection_locked("toggle") {
            return;
        }
        // a picked cell can always be dropped, even after the grid moved on
        if self.selection.remove(&key) {
            self.push_selection(step);
            return;
        }
        let Some(cell) = self.grid.find(&key).cloned() else {
            tracing::debug!(cell = %key, "toggle for unknown cell ignored");
            return;
        };
        if self.selection.toggle(&cell) != Toggle::Rejected {
            self.push_selection(step);
        }
    }

    fn selection_locked(&self, what: &str) -> bool {
        if self.submission.is_idle() {
            return false;
        }
        tracing::debug!(action = what, "selection frozen by pending or accepted bet");
        true
    }

    fn set_time_window(&mut self, secs: u64, step: &mut Step) {
        if !self.config.time_windows.contains(&secs) {
            tracing::debug!(secs, "time window not offered, ignored");
            return;
        }
        if secs == self.time_window_secs {
            return;
        }
        self.time_window_secs = secs;
        step.updates.push(EngineUpdate::TimeWindowChanged { secs });

        let reference = self.book.reference_price();
        let book = &self.book;
        self.grid.regenerate(reference, secs, |side, from, to| {
            book.liquidity_between(side.book_side(), from, to)
        });
        self.push_grid(step);
    }

    fn refresh_grid(&mut self, step: &mut Step) {
        let reference = self.book.reference_price();
        let book = &self.book;
        let window = self.time_window_secs;
        let rebuilt = self.grid.refresh(reference, window, |side, from, to| {
            book.liquidity_between(side.book_side(), from, to)
        });
        if rebuilt {
            self.push_grid(step);
        }
    }

    fn push_grid(&self, step: &mut Step) {
        step.updates.push(EngineUpdate::GridRegenerated {
            generation: self.grid.generation(),
            reference: self.grid.reference(),
            cells: self.grid.cells().len(),
        });
    }

    fn push_selection(&self, step: &mut Step) {
        step.updates.push(EngineUpdate::SelectionChanged {
            selected: self.selection.keys(),
            max_payout: self.selection.max_payout(self.stake),
        });
    }
}
