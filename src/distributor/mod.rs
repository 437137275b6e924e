use log::{debug, error, info};
use serde::Serialize;

use crate::commission::{self, Payout, Skip};
use crate::error::EngineResult;
use crate::ledger::{CommissionRecord, Ledger, LedgerMutation};
use crate::tiers::{self, Cents, Tier, MAX_COMMISSION_DEPTH};

/// A settled purchase whose upline gets paid.
#[derive(Clone, Debug)]
pub struct Purchase<'a> {
    pub buyer: &'a str,
    pub purchase_price: Cents,
    pub commission_base: Cents,
    pub revenue_event_id: &'a str,
    pub tier: Tier,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Distribution {
    pub total_paid_cents: Cents,
    pub payouts: Vec<Payout>,
    pub skipped: Vec<Skip>,
}

/// Walks the buyer's upline, computes payouts and commits them as one batch.
///
/// An empty upline or a chain with nobody eligible is a successful no-op.
/// If the batch fails nothing is written and the store error is returned.
pub fn distribute<L>(ledger: &L, purchase: &Purchase<'_>, now: u64) -> EngineResult<Distribution>
where
    L: Ledger + ?Sized,
{
    let ancestors = ledger.fetch_ancestors(purchase.buyer, MAX_COMMISSION_DEPTH)?;
    if ancestors.is_empty() {
        debug!("{} has no upline, nothing to distribute", purchase.buyer);
        return Ok(Distribution::default());
    }

    let calc = commission::calculate(purchase.buyer, purchase.commission_base, &ancestors);
    if calc.payouts.is_empty() {
        debug!(
            "no eligible ancestors for {} ({} skipped)",
            purchase.buyer,
            calc.skipped.len()
        );
        return Ok(Distribution {
            total_paid_cents: 0,
            payouts: Vec::new(),
            skipped: calc.skipped,
        });
    }

    let batch: Vec<LedgerMutation> = calc
        .payouts
        .iter()
        .map(|payout| {
            LedgerMutation::InsertCommission(CommissionRecord::approved(
                payout,
                purchase.revenue_event_id,
                now,
            ))
        })
        .collect();

    if let Err(err) = ledger.apply(&batch) {
        error!(
            "commission batch for event {} (buyer {}) rolled back: {err}",
            purchase.revenue_event_id, purchase.buyer
        );
        return Err(err.into());
    }

    let total = calc.total_amount();
    info!(
        "event {}: {} {} purchase by {} paid {} to {} ancestors on base {}",
        purchase.revenue_event_id,
        purchase.tier,
        tiers::format_usd(purchase.purchase_price),
        purchase.buyer,
        tiers::format_usd(total),
        calc.payouts.len(),
        tiers::format_usd(purchase.commission_base)
    );
    Ok(Distribution {
        total_paid_cents: total,
        payouts: calc.payouts,
        skipped: calc.skipped,
    })
}
