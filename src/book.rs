use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::{BookSide, Direction, OrderBookSnapshot, OrderLevel, PriceTick, RawDepth};

const WALL_MEAN_RATIO: Decimal = dec!(2.5);
const WALL_MIN_QTY: Decimal = dec!(0.5);

/// Sole writer of the order book snapshot. Depth updates replace the book wholesale.
#[derive(Debug, Default)]
pub struct OrderBookAggregator {
    book: OrderBookSnapshot,
    last_update_id: Option<u64>,
    last_price: Decimal,
    prev_price: Decimal,
}

impl OrderBookAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the snapshot was dropped as older than the book already held.
    pub fn apply_depth_snapshot(&mut self, raw: RawDepth) -> bool {
        if let (Some(seen), Some(id)) = (self.last_update_id, raw.last_update_id) {
            if id < seen {
                tracing::debug!(
                    last_update_id = seen,
                    update_id = id,
                    "stale depth snapshot dropped"
                );
                return false;
            }
        }
        if raw.last_update_id.is_some() {
            self.last_update_id = raw.last_update_id;
        }

        let bids = accumulate(&raw.bids);
        let asks = accumulate(&raw.asks);
        let best_bid = bids.first().map(|l| l.price).unwrap_or(Decimal::ZERO);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(Decimal::ZERO);

        let both = best_bid > Decimal::ZERO && best_ask > Decimal::ZERO;
        let mid_price = if both { (best_bid + best_ask) / dec!(2) } else { self.last_price };
        let spread = if both { best_ask - best_bid } else { Decimal::ZERO };

        if both && best_ask < best_bid {
            tracing::warn!(best_bid = %best_bid, best_ask = %best_ask, "crossed book");
        }

        // built fully before the swap so readers never see a half-applied book
        self.book = OrderBookSnapshot { bids, asks, best_bid, best_ask, mid_price, spread };
        true
    }

    pub fn apply_trade(&mut self, tick: PriceTick) {
        if tick.price <= Decimal::ZERO {
            return;
        }
        self.prev_price = self.last_price;
        self.last_price = tick.price;
        if self.book.best_bid <= Decimal::ZERO || self.book.best_ask <= Decimal::ZERO {
            self.book.mid_price = tick.price;
        }
    }

    pub fn snapshot(&self) -> &OrderBookSnapshot {
        &self.book
    }

    pub fn best_bid(&self) -> Decimal {
        self.book.best_bid
    }

    pub fn best_ask(&self) -> Decimal {
        self.book.best_ask
    }

    pub fn mid_price(&self) -> Decimal {
        self.book.mid_price
    }

    pub fn spread(&self) -> Decimal {
        self.book.spread
    }

    pub fn last_price(&self) -> Decimal {
        self.last_price
    }

    pub fn prev_price(&self) -> Decimal {
        self.prev_price
    }

    pub fn direction(&self) -> Direction {
        if self.prev_price <= Decimal::ZERO || self.last_price == self.prev_price {
            Direction::Neutral
        } else if self.last_price > self.prev_price {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    /// Mid price when both sides are quoted, else the last trade. Zero means unknown.
    pub fn reference_price(&self) -> Decimal {
        if self.book.mid_price > Decimal::ZERO {
            self.book.mid_price
        } else {
            self.last_price
        }
    }

    fn levels(&self, side: BookSide) -> &[OrderLevel] {
        match side {
            BookSide::Bid => &self.book.bids,
            BookSide::Ask => &self.book.asks,
        }
    }

    /// Total quantity on `side` priced inside the inclusive interval, in either bound order.
    pub fn liquidity_between(&self, side: BookSide, from: Decimal, to: Decimal) -> Decimal {
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        self.levels(side)
            .iter()
            .filter(|l| l.price >= lo && l.price <= hi)
            .map(|l| l.quantity)
            .sum()
    }

    /// Mean level quantity; 1 for an empty side.
    pub fn mean_quantity(&self, side: BookSide) -> Decimal {
        let levels = self.levels(side);
        if levels.is_empty() {
            return Decimal::ONE;
        }
        levels.iter().map(|l| l.quantity).sum::<Decimal>() / Decimal::from(levels.len())
    }

    pub fn is_wall(&self, side: BookSide, quantity: Decimal) -> bool {
        quantity > self.mean_quantity(side) * WALL_MEAN_RATIO && quantity > WALL_MIN_QTY
    }

    pub fn walls(&self, side: BookSide) -> Vec<&OrderLevel> {
        let mean = self.mean_quantity(side);
        self.levels(side)
            .iter()
            .filter(|l| l.quantity > mean * WALL_MEAN_RATIO && l.quantity > WALL_MIN_QTY)
            .collect()
    }
}

fn accumulate(levels: &[(Decimal, Decimal)]) -> Vec<OrderLevel> {
    let mut total = Decimal::ZERO;
    levels
        .iter()
        .map(|&(price, quantity)| {
            total += quantity;
            OrderLevel { price, quantity, cumulative_quantity: total }
        })
        .collect()
}
