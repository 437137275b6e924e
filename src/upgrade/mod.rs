use log::{info, warn};
use crate::distributor::{self, Distribution, Purchase};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{AffiliateStatus, Ledger, LedgerMutation, PackageUpgrade};
use crate::tiers::{Cents, Tier};

/// Live package price, falling back to the built-in table.
pub fn resolve_price<L>(ledger: &L, tier: Tier) -> EngineResult<Cents>
where
    L: Ledger + ?Sized,
{
    ledger
        .package_price(tier)?
        .or_else(|| tier.fallback_price())
        .ok_or(EngineError::PriceUnavailable(tier))
}

#[derive(Debug)]
pub struct UpgradeOutcome {
    pub from_tier: Option<Tier>,
    pub to_tier: Tier,
    pub from_price_cents: Cents,
    pub to_price_cents: Cents,
    pub difference_cents: Cents,
    /// The tier change is committed even when this failed.
    pub commissions: EngineResult<Distribution>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradePlan {
    pub from_tier: Option<Tier>,
    pub to_tier: Tier,
    pub from_price_cents: Cents,
    pub to_price_cents: Cents,
    pub difference_cents: Cents,
}

/// Validates an upgrade of `user_id` to `new_tier` and prices it.
pub fn plan<L>(ledger: &L, user_id: &str, new_tier: &str) -> EngineResult<UpgradePlan>
where
    L: Ledger + ?Sized,
{
    let to_tier: Tier = new_tier
        .parse()
        .map_err(|_| EngineError::InvalidTier(new_tier.to_string()))?;
    let user = ledger
        .user(user_id)?
        .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;

    let from_tier = user.current_package;
    if let Some(from) = from_tier {
        if from.level() >= to_tier.level() {
            return Err(EngineError::NotAnUpgrade {
                from,
                from_level: from.level(),
                to: to_tier,
                to_level: to_tier.level(),
            });
        }
    }

    let from_price = match from_tier {
        Some(tier) => resolve_price(ledger, tier)?,
        None => 0,
    };
    let to_price = resolve_price(ledger, to_tier)?;
    if to_price <= from_price {
        return Err(EngineError::NonPositiveDifference {
            from_price,
            to_price,
        });
    }

    Ok(UpgradePlan {
        from_tier,
        to_tier,
        from_price_cents: from_price,
        to_price_cents: to_price,
        difference_cents: to_price - from_price,
    })
}

/// Moves `user_id` up to `new_tier` and pays the upline on the price difference.
///
/// The audit row, package change and affiliate status are one batch; the
/// package change is checked against the tier read during planning so two
/// racing upgrades cannot both apply.
pub fn upgrade<L>(
    ledger: &L,
    user_id: &str,
    new_tier: &str,
    revenue_event_id: &str,
    now: u64,
) -> EngineResult<UpgradeOutcome>
where
    L: Ledger + ?Sized,
{
    let plan = plan(ledger, user_id, new_tier)?;

    let batch = [
        LedgerMutation::InsertUpgrade(PackageUpgrade {
            user_id: user_id.to_string(),
            from_package: plan.from_tier,
            to_package: plan.to_tier,
            from_price_cents: plan.from_price_cents,
            to_price_cents: plan.to_price_cents,
            difference_cents: plan.difference_cents,
            created_at: now,
        }),
        LedgerMutation::SetPackage {
            user_id: user_id.to_string(),
            expected: plan.from_tier,
            package: plan.to_tier,
            activated_at: now,
        },
        LedgerMutation::UpsertAffiliateStatus {
            user_id: user_id.to_string(),
            status: AffiliateStatus {
                tier: plan.to_tier,
                is_active: true,
                tier_depth_limit: plan.to_tier.depth_limit(),
                updated_at: now,
            },
        },
    ];
    ledger.apply(&batch)?;
    info!(
        "{user_id} upgraded {} -> {} (difference {} cents)",
        plan.from_tier.map(Tier::as_str).unwrap_or("none"),
        plan.to_tier,
        plan.difference_cents
    );

    let purchase = Purchase {
        buyer: user_id,
        purchase_price: plan.to_price_cents,
        commission_base: plan.difference_cents,
        revenue_event_id,
        tier: plan.to_tier,
    };
    let commissions = distributor::distribute(ledger, &purchase, now);
    if let Err(err) = &commissions {
        warn!("upgrade of {user_id} committed but commissions failed: {err}");
    }

    Ok(UpgradeOutcome {
        from_tier: plan.from_tier,
        to_tier: plan.to_tier,
        from_price_cents: plan.from_price_cents,
        to_price_cents: plan.to_price_cents,
        difference_cents: plan.difference_cents,
        commissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryStore, StoreError, UserRecord};

    fn store_with(buyer_tier: Option<Tier>) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_user(UserRecord::new("sponsor").with_package(Tier::Titan, true))
            .unwrap();
        let buyer = UserRecord::new("buyer").referred_by("sponsor");
        let buyer = match buyer_tier {
            Some(tier) => buyer.with_package(tier, true),
            None => buyer,
        };
        store.insert_user(buyer).unwrap();
        store
    }

    #[test]
    fn bronze_to_diamond_pays_on_the_difference() {
        let store = store_with(Some(Tier::Bronze));
        let outcome = upgrade(&store, "buyer", "diamond", "ev-up", 7).unwrap();
        assert_eq!(outcome.from_tier, Some(Tier::Bronze));
        assert_eq!(outcome.difference_cents, 240_000);
        let dist = outcome.commissions.unwrap();
        assert_eq!(dist.payouts[0].amount, 24_000);

        let user = store.user_record("buyer").unwrap().unwrap();
        assert_eq!(user.current_package, Some(Tier::Diamond));
        assert_eq!(user.package_activated_at, Some(7));
        let status = user.affiliate_status.unwrap();
        assert_eq!(status.tier, Tier::Diamond);
        assert_eq!(status.tier_depth_limit, 5);
        assert!(status.is_active);

        let audit = store.upgrades_for("buyer").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].from_price_cents, 10_000);
        assert_eq!(audit[0].to_price_cents, 250_000);
    }

    #[test]
    fn rejects_same_or_lower_tier_for_every_pair() {
        let sold = [Tier::Bronze, Tier::Silver, Tier::Gold, Tier::Platinum, Tier::Diamond];
        for from in sold {
            for to in sold.into_iter().filter(|t| t.level() <= from.level()) {
                let store = store_with(Some(from));
                let err = upgrade(&store, "buyer", to.as_str(), "ev", 0).unwrap_err();
                assert!(matches!(err, EngineError::NotAnUpgrade { .. }), "{from} -> {to}");
                assert!(store.upgrades_for("buyer").unwrap().is_empty());
            }
        }
    }

    #[test]
    fn invalid_tier_name() {
        let store = store_with(None);
        let err = upgrade(&store, "buyer", "copper", "ev", 0).unwrap_err();
        assert_eq!(err.to_string(), "Invalid tier");
    }

    #[test]
    fn first_package_uses_full_price() {
        let store = store_with(None);
        let outcome = upgrade(&store, "buyer", "gold", "ev", 0).unwrap();
        assert_eq!(outcome.from_tier, None);
        assert_eq!(outcome.difference_cents, 50_000);
    }

    #[test]
    fn live_prices_override_fallback_and_guard_difference() {
        let store = store_with(Some(Tier::Silver));
        store.set_package_price(Tier::Gold, 20_000).unwrap();
        let err = upgrade(&store, "buyer", "gold", "ev", 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NonPositiveDifference {
                from_price: 25_000,
                to_price: 20_000
            }
        ));
    }

    #[test]
    fn reserved_tier_needs_a_live_price() {
        let store = store_with(Some(Tier::Diamond));
        let err = upgrade(&store, "buyer", "elite", "ev", 0).unwrap_err();
        assert!(matches!(err, EngineError::PriceUnavailable(Tier::Elite)));
        store.set_package_price(Tier::Elite, 500_000).unwrap();
        let outcome = upgrade(&store, "buyer", "elite", "ev", 0).unwrap();
        assert_eq!(outcome.difference_cents, 250_000);
    }

    #[test]
    fn stale_tier_blocks_double_upgrade() {
        let store = store_with(Some(Tier::Bronze));
        let stale = plan(&store, "buyer", "gold").unwrap();
        upgrade(&store, "buyer", "diamond", "ev-1", 0).unwrap();
        let err = store
            .apply(&[LedgerMutation::SetPackage {
                user_id: "buyer".into(),
                expected: stale.from_tier,
                package: stale.to_tier,
                activated_at: 0,
            }])
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTier { .. }));
        let user = store.user_record("buyer").unwrap().unwrap();
        assert_eq!(user.current_package, Some(Tier::Diamond));
    }

    #[test]
    fn failed_upgrade_batch_changes_nothing() {
        let store = store_with(Some(Tier::Bronze));
        store.fail_mutation_at(2).unwrap();
        let err = upgrade(&store, "buyer", "gold", "ev-1", 0).unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::InjectedFault { index: 2 })));
        let user = store.user_record("buyer").unwrap().unwrap();
        assert_eq!(user.current_package, Some(Tier::Bronze));
        assert!(store.upgrades_for("buyer").unwrap().is_empty());
        assert!(store.commissions_for("sponsor").unwrap().is_empty());
    }

    #[test]
    fn tier_change_stands_when_commissions_fail() {
        let store = store_with(Some(Tier::Bronze));
        upgrade(&store, "buyer", "silver", "ev-1", 0).unwrap();
        // reusing the event id makes the commission batch collide
        let outcome = upgrade(&store, "buyer", "gold", "ev-1", 0).unwrap();
        assert!(matches!(
            outcome.commissions,
            Err(EngineError::Store(StoreError::DuplicateRecord { .. }))
        ));
        let user = store.user_record("buyer").unwrap().unwrap();
        assert_eq!(user.current_package, Some(Tier::Gold));
        assert_eq!(store.upgrades_for("buyer").unwrap().len(), 2);
        assert_eq!(store.commissions_for("sponsor").unwrap().len(), 1);
    }
}
