use serde::Serialize;

use crate::commission::{self, Payout, Skip};
use crate::error::{EngineError, EngineResult};
use crate::ledger::Ledger;
use crate::tiers::{Cents, Tier, MAX_COMMISSION_DEPTH};
use crate::upgrade::resolve_price;

/// Preview of what a purchase would pay. Nothing is written.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Simulation {
    pub purchase_price_cents: Cents,
    pub commission_base_cents: Cents,
    pub payouts: Vec<Payout>,
    pub skipped: Vec<Skip>,
    pub total_commission_cents: Cents,
}

pub fn simulate<L>(ledger: &L, buyer: &str, tier: &str, is_upgrade: bool) -> EngineResult<Simulation>
where
    L: Ledger + ?Sized,
{
    let tier: Tier = tier
        .parse()
        .map_err(|_| EngineError::InvalidTier(tier.to_string()))?;
    let user = ledger
        .user(buyer)?
        .ok_or_else(|| EngineError::UserNotFound(buyer.to_string()))?;

    let purchase_price = resolve_price(ledger, tier)?;
    let commission_base = match (is_upgrade, user.current_package) {
        (true, Some(current)) => {
            purchase_price.saturating_sub(resolve_price(ledger, current)?)
        }
        _ => purchase_price,
    };

    let ancestors = ledger.fetch_ancestors(buyer, MAX_COMMISSION_DEPTH)?;
    let calc = commission::calculate(buyer, commission_base, &ancestors);
    Ok(Simulation {
        purchase_price_cents: purchase_price,
        commission_base_cents: commission_base,
        total_commission_cents: calc.total_amount(),
        payouts: calc.payouts,
        skipped: calc.skipped,
    })
}
