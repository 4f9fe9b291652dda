use async_trait::async_trait;

use super::{Bet, Confirmation, SettlementClient, SettlementError};
use crate::payout::payout_lamports;

/// Logs each bet and confirms it locally. Used when no ledger endpoint is configured.
#[derive(Clone, Default)]
pub struct DryRunSettlement;

impl DryRunSettlement {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SettlementClient for DryRunSettlement {
    async fn submit(&self, bet: &Bet) -> Result<Confirmation, SettlementError> {
        let confirmation = Confirmation(format!("dry-run-{}", uuid::Uuid::new_v4()));
        tracing::info!(
            round_id = bet.round_id,
            stake_lamports = bet.stake_lamports,
            zones = bet.zones.len(),
            confirmation = %confirmation,
            "bet (dry run)"
        );
        for z in &bet.zones {
            let payout_if_hit = payout_lamports(bet.stake_lamports, u32::from(z.multiplier_bps));
            tracing::info!(
                round_id = bet.round_id,
                lower = z.lower_bound,
                upper = z.upper_bound,
                multiplier_bps = z.multiplier_bps,
                payout_if_hit = payout_if_hit.unwrap_or(u64::MAX),
                "zone"
            );
        }
        Ok(confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::Zone;

    #[tokio::test]
    async fn dry_run_always_confirms() {
        let zone = Zone { lower_bound: 1, upper_bound: 2, multiplier_bps: 15_000 };
        let bet = Bet { round_id: 1, stake_lamports: 10, zones: vec![zone] };
        let a = DryRunSettlement::new().submit(&bet).await.unwrap();
        let b = DryRunSettlement::new().submit(&bet).await.unwrap();
        assert!(a.0.starts_with("dry-run-"));
        assert_ne!(a, b);
    }
}
