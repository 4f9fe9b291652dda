use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Multiplier scale: 10_000 bps = 1.0x.
pub const BPS_SCALE: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub time_ms: i64,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative_quantity: Decimal,
}

/// Full depth replacement as parsed off the wire, best-to-worst per side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDepth {
    pub last_update_id: Option<u64>,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<OrderLevel>,
    pub asks: Vec<OrderLevel>,
    /// Zero when the side is empty.
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid_price: Decimal,
    pub spread: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// Which way the player expects price to travel to reach a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Above,
    Below,
}

impl Side {
    /// Book side whose resting liquidity sits between the price and a cell on this side.
    pub fn book_side(self) -> BookSide {
        match self {
            Side::Above => BookSide::Ask,
            Side::Below => BookSide::Bid,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Above => f.write_str("above"),
            Side::Below => f.write_str("below"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "above" | "up" | "long" | "ask" => Ok(Side::Above),
            "below" | "down" | "short" | "bid" => Ok(Side::Below),
            other => anyhow::bail!("unknown side: {}", other),
        }
    }
}

/// Canonical cell identity: side plus the lower bound as a fixed-point integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub side: Side,
    pub lower_fixed: i64,
}

impl std::fmt::Display for CellKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.side, self.lower_fixed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellKey,
    pub price_lower: Decimal,
    pub price_upper: Decimal,
    /// 0 is the tier nearest the reference price.
    pub distance_tier: usize,
    pub multiplier_bps: u32,
    pub side: Side,
}

impl Cell {
    pub fn new(
        side: Side,
        price_lower: Decimal,
        price_upper: Decimal,
        distance_tier: usize,
        multiplier_bps: u32,
        price_decimals: u32,
    ) -> Option<Self> {
        let lower_fixed = to_fixed(price_lower, price_decimals)?.to_i64()?;
        Some(Self {
            id: CellKey { side, lower_fixed },
            price_lower,
            price_upper,
            distance_tier,
            multiplier_bps,
            side,
        })
    }

    /// Overshoot counts: an above-cell is reached once price trades at or past its lower edge.
    pub fn is_hit_by(&self, price: Decimal) -> bool {
        if price <= Decimal::ZERO {
            return false;
        }
        match self.side {
            Side::Above => price >= self.price_lower,
            Side::Below => price <= self.price_upper,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Betting,
    Live,
    Result,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Betting => f.write_str("betting"),
            Phase::Live => f.write_str("live"),
            Phase::Result => f.write_str("result"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

/// `floor(value * 10^decimals)`; None for negative or unrepresentable values.
pub fn to_fixed(value: Decimal, decimals: u32) -> Option<u64> {
    if value.is_sign_negative() {
        return None;
    }
    let scale = Decimal::from(10u64.checked_pow(decimals)?);
    value.checked_mul(scale)?.floor().to_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fixed_point_floors() {
        assert_eq!(to_fixed(dec!(100.057), 2), Some(10005));
        assert_eq!(to_fixed(dec!(0.05), 9), Some(50_000_000));
        assert_eq!(to_fixed(dec!(-1), 2), None);
    }

    #[test]
    fn hit_condition_counts_overshoot() {
        let above = Cell::new(Side::Above, dec!(100.05), dec!(100.10), 0, 15_000, 2).unwrap();
        assert!(!above.is_hit_by(dec!(100.04)));
        assert!(above.is_hit_by(dec!(100.05)));
        assert!(above.is_hit_by(dec!(101.00)));

        let below = Cell::new(Side::Below, dec!(99.90), dec!(99.95), 0, 15_000, 2).unwrap();
        assert!(!below.is_hit_by(dec!(99.96)));
        assert!(below.is_hit_by(dec!(99.95)));
        assert!(below.is_hit_by(dec!(98.00)));
        assert!(!below.is_hit_by(Decimal::ZERO));
    }

    #[test]
    fn key_uses_fixed_lower_bound() {
        let a = Cell::new(Side::Above, dec!(100.051), dec!(100.10), 0, 15_000, 2).unwrap();
        let b = Cell::new(Side::Above, dec!(100.059), dec!(100.11), 1, 30_000, 2).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.lower_fixed, 10005);
    }
}
