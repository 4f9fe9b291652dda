use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{Cell, Side, BPS_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Offset from the reference price, in bps of that price.
    pub distance_bps: u32,
    pub base_multiplier_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPolicy {
    /// `(max window secs, factor)`, ascending.
    /// Windows past the last entry use `default_time_factor`.
    pub time_factors: Vec<(u64, Decimal)>,
    pub default_time_factor: Decimal,
    pub liquidity_k: Decimal,
    pub liquidity_cap: Decimal,
}

impl Default for LiquidityPolicy {
    fn default() -> Self {
        Self {
            time_factors: vec![(30, dec!(2.5)), (60, dec!(1.5))],
            default_time_factor: Decimal::ONE,
            liquidity_k: dec!(0.8),
            liquidity_cap: dec!(10),
        }
    }
}

impl LiquidityPolicy {
    pub fn time_factor(&self, window_secs: u64) -> Decimal {
        self.time_factors
            .iter()
            .find(|(max, _)| window_secs <= *max)
            .map(|(_, f)| *f)
            .unwrap_or(self.default_time_factor)
    }

    pub fn liquidity_factor(&self, liquidity: Decimal) -> Decimal {
        Decimal::ONE + (liquidity * self.liquidity_k).min(self.liquidity_cap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MultiplierPolicy {
    /// Fixed lookup keyed by tier.
    Static,
    LiquidityTime(LiquidityPolicy),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridConfig {
    /// Nearest first.
    pub tiers: Vec<Tier>,
    /// Cell half-width as a fraction of the tier offset.
    pub band_ratio: Decimal,
    /// Grid regenerates when `floor(reference / bucket_size)` changes.
    pub bucket_size: Decimal,
    pub price_decimals: u32,
    pub policy: MultiplierPolicy,
}

impl GridConfig {
    pub fn multiplier_for<F>(
        &self,
        tier: &Tier,
        side: Side,
        reference: Decimal,
        near_edge: Decimal,
        window_secs: u64,
        liquidity: &F,
    ) -> u32
    where
        F: Fn(Side, Decimal, Decimal) -> Decimal,
    {
        match &self.policy {
            MultiplierPolicy::Static => tier.base_multiplier_bps,
            MultiplierPolicy::LiquidityTime(p) => {
                let liq = liquidity(side, reference, near_edge);
                let m = Decimal::from(tier.base_multiplier_bps)
                    * p.time_factor(window_secs)
                    * p.liquidity_factor(liq);
                m.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                    .to_u32()
                    .unwrap_or(u32::MAX)
                    .max(BPS_SCALE)
            }
        }
    }
}

/// Cells for one reference price: an above and a below cell per tier.
/// `liquidity(side, from, to)` returns resting size between the two prices on the side's book.
pub fn generate<F>(
    reference: Decimal,
    config: &GridConfig,
    window_secs: u64,
    liquidity: F,
) -> Vec<Cell>
where
    F: Fn(Side, Decimal, Decimal) -> Decimal,
{
    if reference <= Decimal::ZERO {
        return Vec::new();
    }
    let dp = config.price_decimals;
    let mut cells: Vec<Cell> = Vec::with_capacity(config.tiers.len() * 2);

    for (idx, tier) in config.tiers.iter().enumerate() {
        let offset = reference * Decimal::from(tier.distance_bps) / Decimal::from(BPS_SCALE);
        let band = offset * config.band_ratio;

        for side in [Side::Above, Side::Below] {
            let centre = match side {
                Side::Above => reference + offset,
                Side::Below => reference - offset,
            };
            let lower =
                (centre - band).round_dp_with_strategy(dp, RoundingStrategy::ToNegativeInfinity);
            let upper =
                (centre + band).round_dp_with_strategy(dp, RoundingStrategy::ToPositiveInfinity);
            if lower <= Decimal::ZERO || lower >= upper {
                tracing::debug!(
                    tier = idx,
                    side = %side,
                    lower = %lower,
                    upper = %upper,
                    "degenerate cell skipped"
                );
                continue;
            }
            let near_edge = match side {
                Side::Above => lower,
                Side::Below => upper,
            };
            let bps =
                config.multiplier_for(tier, side, reference, near_edge, window_secs, &liquidity);
            let Some(cell) = Cell::new(side, lower, upper, idx, bps, dp) else { continue };
            // rounding can fold two tiers onto one band at low prices; the nearer tier keeps it
            if cells.iter().any(|c| c.id == cell.id) {
                tracing::debug!(tier = idx, side = %side, lower = %lower, "duplicate cell skipped");
                continue;
            }
            cells.push(cell);
        }
    }
    cells
}

/// Current grid plus the quantization state that decides when it is rebuilt.
#[derive(Debug)]
pub struct Grid {
    config: GridConfig,
    bucket: Option<i64>,
    reference: Decimal,
    cells: Vec<Cell>,
    generation: u64,
}

impl Grid {
    pub fn new(config: GridConfig) -> Self {
        Self { config, bucket: None, reference: Decimal::ZERO, cells: Vec::new(), generation: 0 }
    }

    pub fn bucket_of(&self, price: Decimal) -> Option<i64> {
        if price <= Decimal::ZERO || self.config.bucket_size <= Decimal::ZERO {
            return None;
        }
        (price / self.config.bucket_size).floor().to_i64()
    }

    /// Rebuilds only when `reference` lands in a different bucket. Returns true on rebuild.
    pub fn refresh<F>(&mut self, reference: Decimal, window_secs: u64, liquidity: F) -> bool
    where
        F: Fn(Side, Decimal, Decimal) -> Decimal,
    {
        let bucket = self.bucket_of(reference);
        if bucket == self.bucket {
            return false;
        }
        self.rebuild(bucket, reference, window_secs, liquidity);
        true
    }

    /// Rebuilds unconditionally at the given reference, e.g. after a time-window change.
    pub fn regenerate<F>(&mut self, reference: Decimal, window_secs: u64, liquidity: F)
    where
        F: Fn(Side, Decimal, Decimal) -> Decimal,
    {
        let bucket = self.bucket_of(reference);
        self.rebuild(bucket, reference, window_secs, liquidity);
    }

    fn rebuild<F>(
        &mut self,
        bucket: Option<i64>,
        reference: Decimal,
        window_secs: u64,
        liquidity: F,
    )
    where
        F: Fn(Side, Decimal, Decimal) -> Decimal,
    {
        self.bucket = bucket;
        if bucket.is_none() {
            self.reference = Decimal::ZERO;
            self.cells.clear();
        } else {
            self.reference = reference;
            self.cells = generate(reference, &self.config, window_secs, liquidity);
        }
        self.generation += 1;
        tracing::debug!(
            generation = self.generation,
            reference = %self.reference,
            cells = self.cells.len(),
            "grid regenerated"
        );
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn find(&self, id: &crate::types::CellKey) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == *id)
    }

    pub fn reference(&self) -> Decimal {
        self.reference
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CellKey;

    fn tiers() -> Vec<Tier> {
        vec![
            Tier { distance_bps: 5, base_multiplier_bps: 15_000 },
            Tier { distance_bps: 10, base_multiplier_bps: 30_000 },
            Tier { distance_bps: 20, base_multiplier_bps: 55_400 },
        ]
    }

    fn config(policy: MultiplierPolicy) -> GridConfig {
        GridConfig {
            tiers: tiers(),
            band_ratio: dec!(0.1),
            bucket_size: dec!(1),
            price_decimals: 2,
            policy,
        }
    }

    fn no_liquidity(_: Side, _: Decimal, _: Decimal) -> Decimal {
        Decimal::ZERO
    }

    #[test]
    fn static_grid_layout() {
        let cells = generate(dec!(1000), &config(MultiplierPolicy::Static), 60, no_liquidity);
        assert_eq!(cells.len(), 6);

        let above: Vec<_> = cells.iter().filter(|c| c.side == Side::Above).collect();
        // tier 0: offset 0.5, band 0.05
        assert_eq!(above[0].price_lower, dec!(1000.45));
        assert_eq!(above[0].price_upper, dec!(1000.55));
        assert_eq!(above[0].multiplier_bps, 15_000);

        let below: Vec<_> = cells.iter().filter(|c| c.side == Side::Below).collect();
        assert_eq!(below[2].price_lower, dec!(997.80));
        assert_eq!(below[2].price_upper, dec!(998.20));
        assert_eq!(below[2].distance_tier, 2);
    }

    #[test]
    fn multipliers_grow_with_distance() {
        let cells = generate(dec!(1000), &config(MultiplierPolicy::Static), 60, no_liquidity);
        for side in [Side::Above, Side::Below] {
            let m: Vec<u32> =
                cells.iter().filter(|c| c.side == side).map(|c| c.multiplier_bps).collect();
            assert!(m.windows(2).all(|w| w[0] < w[1]), "{:?}", m);
        }
    }

    #[test]
    fn no_price_means_no_cells() {
        let cfg = config(MultiplierPolicy::Static);
        assert!(generate(Decimal::ZERO, &cfg, 60, no_liquidity).is_empty());
        assert!(generate(dec!(-5), &cfg, 60, no_liquidity).is_empty());
    }

    #[test]
    fn liquidity_policy_scales_base() {
        let cfg = config(MultiplierPolicy::LiquidityTime(LiquidityPolicy::default()));
        let thin = generate(dec!(1000), &cfg, 120, no_liquidity);
        assert_eq!(thin[0].multiplier_bps, 15_000);

        let short = generate(dec!(1000), &cfg, 30, no_liquidity);
        assert_eq!(short[0].multiplier_bps, 37_500);

        // 2.5 units behind the cell: 1 + min(2.0, 10) = 3
        let thick = generate(dec!(1000), &cfg, 60, |_, _, _| dec!(2.5));
        assert_eq!(thick[0].multiplier_bps, 67_500);

        let capped = generate(dec!(1000), &cfg, 120, |_, _, _| dec!(500));
        assert_eq!(capped[0].multiplier_bps, 165_000);
    }

    #[test]
    fn liquidity_is_queried_on_the_cell_side() {
        let cfg = config(MultiplierPolicy::LiquidityTime(LiquidityPolicy::default()));
        let cells = generate(dec!(1000), &cfg, 120, |side, from, to| {
            assert_eq!(from, dec!(1000));
            match side {
                Side::Above => {
                    assert!(to > from);
                    dec!(1.25)
                }
                Side::Below => {
                    assert!(to < from);
                    Decimal::ZERO
                }
            }
        });
        let above = cells.iter().find(|c| c.side == Side::Above).unwrap();
        let below = cells.iter().find(|c| c.side == Side::Below).unwrap();
        assert_eq!(above.multiplier_bps, 30_000);
        assert_eq!(below.multiplier_bps, 15_000);
    }

    #[test]
    fn grid_is_stable_within_bucket() {
        let mut grid = Grid::new(config(MultiplierPolicy::Static));
        assert!(grid.refresh(dec!(100.00), 60, no_liquidity));
        let ids: Vec<CellKey> = grid.cells().iter().map(|c| c.id).collect();

        assert!(!grid.refresh(dec!(100.01), 60, no_liquidity));
        assert!(!grid.refresh(dec!(100.02), 60, no_liquidity));
        let after: Vec<CellKey> = grid.cells().iter().map(|c| c.id).collect();
        assert_eq!(ids, after);
        assert_eq!(grid.generation(), 1);

        assert!(grid.refresh(dec!(101.00), 60, no_liquidity));
        assert_eq!(grid.generation(), 2);
        assert_ne!(ids, grid.cells().iter().map(|c| c.id).collect::<Vec<_>>());
        assert_eq!(grid.reference(), dec!(101.00));
    }

    #[test]
    fn grid_empties_when_price_is_lost() {
        let mut grid = Grid::new(config(MultiplierPolicy::Static));
        grid.refresh(dec!(100), 60, no_liquidity);
        assert!(!grid.cells().is_empty());
        assert!(grid.refresh(Decimal::ZERO, 60, no_liquidity));
        assert!(grid.cells().is_empty());
        assert!(!grid.refresh(Decimal::ZERO, 60, no_liquidity));
    }

    #[test]
    fn folded_tiers_keep_one_cell_per_band() {
        let cells = generate(dec!(1.00), &config(MultiplierPolicy::Static), 60, no_liquidity);
        // every tier rounds out to [1.00, 1.01] above and [0.99, 1.00] below
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|c| c.distance_tier == 0 && c.multiplier_bps == 15_000));
        let above = cells.iter().find(|c| c.side == Side::Above).unwrap();
        assert_eq!((above.price_lower, above.price_upper), (dec!(1.00), dec!(1.01)));
        let below = cells.iter().find(|c| c.side == Side::Below).unwrap();
        assert_eq!((below.price_lower, below.price_upper), (dec!(0.99), dec!(1.00)));
    }

    #[test]
    fn find_by_key() {
        let mut grid = Grid::new(config(MultiplierPolicy::Static));
        grid.refresh(dec!(1000), 60, no_liquidity);
        let c = grid.cells()[3].clone();
        assert_eq!(grid.find(&c.id), Some(&c));
        assert!(grid.find(&CellKey { side: Side::Above, lower_fixed: 1 }).is_none());
    }
}
