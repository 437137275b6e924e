//! The four operations the payment and preview collaborators call.
//!
//! Each returns a result shape that separates "nothing to pay" (success with
//! no payouts) from "failed" (`success: false` plus a message).

use std::time::{SystemTime, UNIX_EPOCH};

use log::error;
use serde::Serialize;

use crate::commission::{Payout, Skip};
use crate::distributor::{self, Distribution, Purchase};
use crate::error::EngineResult;
use crate::ledger::{CommissionRecord, Ledger};
use crate::simulator::{self, Simulation};
use crate::tiers::{Cents, Tier};
use crate::{referrer, upgrade};

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CommissionResult {
    pub success: bool,
    pub total_paid_cents: Cents,
    pub payouts: Vec<Payout>,
    pub skipped: Vec<Skip>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommissionResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

impl From<EngineResult<Distribution>> for CommissionResult {
    fn from(result: EngineResult<Distribution>) -> Self {
        match result {
            Ok(dist) => Self {
                success: true,
                total_paid_cents: dist.total_paid_cents,
                payouts: dist.payouts,
                skipped: dist.skipped,
                error: None,
            },
            Err(err) => Self::failed(err.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct UpgradeResult {
    #[serde(flatten)]
    pub result: CommissionResult,
    pub is_upgrade: bool,
    pub from_tier: Option<Tier>,
    pub to_tier: Option<Tier>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReferrerResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Engine<S> {
    store: S,
    clock: fn() -> u64,
}

impl<S: Ledger> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: unix_now,
        }
    }

    pub fn with_clock(store: S, clock: fn() -> u64) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Pays the buyer's upline for a settled purchase.
    pub fn distribute_commissions(
        &self,
        buyer: &str,
        purchase_price: Cents,
        commission_base: Cents,
        revenue_event_id: &str,
        tier: Tier,
    ) -> CommissionResult {
        let purchase = Purchase {
            buyer,
            purchase_price,
            commission_base,
            revenue_event_id,
            tier,
        };
        distributor::distribute(&self.store, &purchase, (self.clock)()).into()
    }

    pub fn handle_package_upgrade(
        &self,
        user_id: &str,
        new_tier: &str,
        revenue_event_id: &str,
    ) -> UpgradeResult {
        match upgrade::upgrade(&self.store, user_id, new_tier, revenue_event_id, (self.clock)()) {
            Ok(outcome) => UpgradeResult {
                result: outcome.commissions.into(),
                is_upgrade: true,
                from_tier: outcome.from_tier,
                to_tier: Some(outcome.to_tier),
            },
            Err(err) => {
                if !err.is_validation() {
                    error!("upgrade of {user_id} to {new_tier} failed: {err}");
                }
                UpgradeResult {
                    result: CommissionResult::failed(err.to_string()),
                    is_upgrade: false,
                    from_tier: None,
                    to_tier: new_tier.parse().ok(),
                }
            }
        }
    }

    pub fn set_referrer(&self, user_id: &str, referrer_id: &str) -> ReferrerResult {
        match referrer::assign(&self.store, user_id, referrer_id) {
            Ok(()) => ReferrerResult {
                success: true,
                error: None,
            },
            Err(err) => ReferrerResult {
                success: false,
                error: Some(err.to_string()),
            },
        }
    }

    pub fn simulate_commissions(
        &self,
        buyer: &str,
        tier: &str,
        is_upgrade: bool,
    ) -> EngineResult<Simulation> {
        simulator::simulate(&self.store, buyer, tier, is_upgrade)
    }

    pub fn commissions_for(&self, beneficiary: &str) -> EngineResult<Vec<CommissionRecord>> {
        Ok(self.store.commissions_for(beneficiary)?)
    }

    pub fn commissions_for_event(&self, revenue_event_id: &str) -> EngineResult<Vec<CommissionRecord>> {
        Ok(self.store.commissions_for_event(revenue_event_id)?)
    }
}
