use rust_decimal::Decimal;

use crate::types::BPS_SCALE;

/// `stake * multiplier_bps / 10_000`, exact in decimal arithmetic.
pub fn payout_for(stake: Decimal, multiplier_bps: u32) -> Decimal {
    stake * Decimal::from(multiplier_bps) / Decimal::from(BPS_SCALE)
}

/// Integer payout as the ledger computes it; None on overflow.
pub fn payout_lamports(stake_lamports: u64, multiplier_bps: u32) -> Option<u64> {
    let p = (stake_lamports as u128).checked_mul(multiplier_bps as u128)? / BPS_SCALE as u128;
    u64::try_from(p).ok()
}

/// Sum of `payout_for` over bets marked hit.
pub fn round_payout<I>(stake: Decimal, bets: I) -> Decimal
where
    I: IntoIterator<Item = (u32, bool)>,
{
    bets.into_iter()
        .filter(|(_, hit)| *hit)
        .map(|(bps, _)| payout_for(stake, bps))
        .sum()
}

/// Best case for a selection: every cell hit.
pub fn max_payout<I>(stake: Decimal, multipliers: I) -> Decimal
where
    I: IntoIterator<Item = u32>,
{
    multipliers.into_iter().map(|bps| payout_for(stake, bps)).sum()
}
