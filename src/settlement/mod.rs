pub mod http;
pub mod observer;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{to_fixed, Cell, BPS_SCALE};

pub use http::HttpSettlement;
pub use observer::DryRunSettlement;

/// Lamports per SOL as a power of ten.
pub const LAMPORT_DECIMALS: u32 = 9;

/// Mirrors the ledger's rejection table, plus client-side conditions the ledger would hit later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("amount must be greater than 0")]
    InvalidAmount,
    #[error("stake {stake} is below the minimum {min}")]
    BelowMinimumStake { stake: Decimal, min: Decimal },
    #[error("must select 1 to {max} zones, got {count}")]
    InvalidZoneCount { count: usize, max: usize },
    #[error("zone lower_bound {lower} must be less than upper_bound {upper}")]
    InvalidZoneBounds { lower: u64, upper: u64 },
    #[error("multiplier {0} bps must be >= 10000 (1x)")]
    InvalidMultiplier(u32),
    #[error("multiplier {0} bps does not fit the ledger's u16 field")]
    MultiplierOutOfRange(u32),
    #[error("math overflow")]
    MathOverflow,
    #[error("ledger rejected bet: {0}")]
    Rejected(String),
    #[error("settlement transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub multiplier_bps: u16,
}

/// A finalized bet as the ledger accepts it. Built once, never mutated after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub round_id: u64,
    pub stake_lamports: u64,
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BetRules {
    pub min_stake: Decimal,
    pub max_zones: usize,
    pub price_decimals: u32,
}

impl Bet {
    pub fn from_cells(
        round_id: u64,
        stake: Decimal,
        cells: &[Cell],
        rules: &BetRules,
    ) -> Result<Self, SettlementError> {
        if stake <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount);
        }
        if stake < rules.min_stake {
            return Err(SettlementError::BelowMinimumStake { stake, min: rules.min_stake });
        }
        if cells.is_empty() || cells.len() > rules.max_zones {
            let count = cells.len();
            return Err(SettlementError::InvalidZoneCount { count, max: rules.max_zones });
        }

        let stake_lamports =
            to_fixed(stake, LAMPORT_DECIMALS).ok_or(SettlementError::MathOverflow)?;
        if stake_lamports == 0 {
            return Err(SettlementError::InvalidAmount);
        }

        let zones = cells
            .iter()
            .map(|c| zone_for(c, rules.price_decimals))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { round_id, stake_lamports, zones })
    }
}

fn zone_for(cell: &Cell, price_decimals: u32) -> Result<Zone, SettlementError> {
    let lower = to_fixed(cell.price_lower, price_decimals).ok_or(SettlementError::MathOverflow)?;
    let upper = to_fixed(cell.price_upper, price_decimals).ok_or(SettlementError::MathOverflow)?;
    if lower >= upper {
        return Err(SettlementError::InvalidZoneBounds { lower, upper });
    }
    if cell.multiplier_bps < BPS_SCALE {
        return Err(SettlementError::InvalidMultiplier(cell.multiplier_bps));
    }
    let multiplier_bps = u16::try_from(cell.multiplier_bps)
        .map_err(|_| SettlementError::MultiplierOutOfRange(cell.multiplier_bps))?;
    Ok(Zone { lower_bound: lower, upper_bound: upper, multiplier_bps })
}

/// Ledger-side confirmation handle (transaction signature or equivalent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation(pub String);

impl std::fmt::Display for Confirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The external ledger. Implementations must not retry on their own.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn submit(&self, bet: &Bet) -> Result<Confirmation, SettlementError>;
}

/// Round ids restart every session; the ledger keys bets by (player, round id),
/// so the session start is folded in to keep ids unique across sessions.
pub fn ledger_round_id(session_started_ms: i64, round_id: u64) -> u64 {
    (session_started_ms.max(0) as u64 / 1_000)
        .saturating_mul(1_000_000)
        .saturating_add(round_id % 1_000_000)
}
