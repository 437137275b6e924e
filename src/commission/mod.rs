use std::collections::BTreeSet;
use std::fmt;

use log::debug;
use serde::{Serialize, Serializer};

use crate::graph::{Ancestor, UserId};
use crate::tiers::{self, Cents, RateMicro, Tier, MAX_COMMISSION_DEPTH};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Payout {
    pub beneficiary_user_id: UserId,
    pub referred_user_id: UserId,
    pub layer: u32,
    #[serde(rename = "rate_percent", with = "tiers::percent")]
    pub rate: RateMicro,
    #[serde(rename = "amount_cents")]
    pub amount: Cents,
    pub notes: String,
}

/// Why an ancestor earned nothing at its layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    CircularReference,
    NoPackage,
    InactiveAffiliate,
    InsufficientLevel { tier: Tier, level: u32, layer: u32 },
    NoRateForLayer { layer: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CircularReference => f.write_str("circular_reference"),
            SkipReason::NoPackage => f.write_str("no_package"),
            SkipReason::InactiveAffiliate => f.write_str("inactive_affiliate"),
            SkipReason::InsufficientLevel { tier, level, layer } => {
                write!(f, "package_{tier}_level_{level}_insufficient_for_layer_{layer}")
            }
            SkipReason::NoRateForLayer { layer } => write!(f, "no_rate_for_layer_{layer}"),
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Skip {
    pub user_id: UserId,
    pub layer: u32,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Calculation {
    pub payouts: Vec<Payout>,
    pub skipped: Vec<Skip>,
}

impl Calculation {
    pub fn total_amount(&self) -> Cents {
        self.payouts.iter().map(|p| p.amount).sum()
    }
}

/// Decides whether `ancestor` may earn at `layer`; returns its package level.
pub fn evaluate(ancestor: &Ancestor, layer: u32) -> Result<u32, SkipReason> {
    let tier = ancestor.current_package.ok_or(SkipReason::NoPackage)?;
    if !ancestor.is_active_affiliate {
        return Err(SkipReason::InactiveAffiliate);
    }
    let level = tier.level();
    if level < layer {
        return Err(SkipReason::InsufficientLevel { tier, level, layer });
    }
    Ok(level)
}

/// Pairs each ancestor with a layer and produces payouts and skips.
///
/// Every ancestor consumes one layer whether or not it earns, so a skipped
/// ancestor's rate slot is never handed to someone deeper in the chain.
pub fn calculate(buyer: &str, commission_base: Cents, ancestors: &[Ancestor]) -> Calculation {
    let mut calc = Calculation::default();
    let mut visited = BTreeSet::new();
    visited.insert(buyer);

    for (idx, ancestor) in ancestors.iter().enumerate() {
        let layer = idx as u32 + 1;
        if layer > MAX_COMMISSION_DEPTH {
            break;
        }
        if !visited.insert(ancestor.id.as_str()) {
            calc.skipped.push(Skip {
                user_id: ancestor.id.clone(),
                layer,
                reason: SkipReason::CircularReference,
            });
            break;
        }

        if let Err(reason) = evaluate(ancestor, layer) {
            debug!("skip {} at layer {layer}: {reason}", ancestor.id);
            calc.skipped.push(Skip {
                user_id: ancestor.id.clone(),
                layer,
                reason,
            });
            continue;
        }

        let rate = match tiers::layer_rate(layer) {
            Some(rate) if rate > 0 => rate,
            _ => {
                calc.skipped.push(Skip {
                    user_id: ancestor.id.clone(),
                    layer,
                    reason: SkipReason::NoRateForLayer { layer },
                });
                continue;
            }
        };

        let amount = tiers::commission_amount(commission_base, rate);
        if amount == 0 {
            debug!("layer {layer} commission for {} rounds to zero", ancestor.id);
            continue;
        }
        calc.payouts.push(Payout {
            beneficiary_user_id: ancestor.id.clone(),
            referred_user_id: buyer.to_string(),
            layer,
            rate,
            amount,
            notes: format!(
                "Layer {layer} commission: {} of {}",
                tiers::format_rate(rate),
                tiers::format_usd(commission_base)
            ),
        });
    }
    calc
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn ancestor(id: &str, tier: Option<Tier>, active: bool) -> Ancestor {
        Ancestor {
            id: id.into(),
            current_package: tier,
            referred_by: None,
            is_active_affiliate: active,
        }
    }

    #[test]
    fn mixed_chain_pays_eligible_layers() {
        let chain = vec![
            ancestor("l1", Some(Tier::Bronze), true),
            ancestor("l2", Some(Tier::Gold), true),
            ancestor("l3", None, false),
        ];
        let calc = calculate("buyer", 50_000, &chain);
        assert_eq!(calc.payouts.len(), 2);
        assert_eq!(calc.payouts[0].layer, 1);
        assert_eq!(calc.payouts[0].rate, 10_000_000);
        assert_eq!(calc.payouts[0].amount, 5_000);
        assert_eq!(calc.payouts[1].layer, 2);
        assert_eq!(calc.payouts[1].rate, 5_000_000);
        assert_eq!(calc.payouts[1].amount, 2_500);
        assert_eq!(calc.payouts[1].referred_user_id, "buyer");
        assert_eq!(
            calc.skipped,
            vec![Skip {
                user_id: "l3".into(),
                layer: 3,
                reason: SkipReason::NoPackage
            }]
        );
        assert_eq!(calc.total_amount(), 7_500);
    }

    #[test]
    fn ineligible_ancestor_still_consumes_a_layer() {
        let chain = vec![
            ancestor("inactive", Some(Tier::Diamond), false),
            ancestor("next", Some(Tier::Diamond), true),
        ];
        let calc = calculate("buyer", 10_000, &chain);
        assert_eq!(calc.skipped[0].reason, SkipReason::InactiveAffiliate);
        assert_eq!(calc.skipped[0].layer, 1);
        assert_eq!(calc.payouts[0].beneficiary_user_id, "next");
        assert_eq!(calc.payouts[0].layer, 2);
        assert_eq!(calc.payouts[0].amount, 500);
    }

    #[test]
    fn low_level_package_is_skipped_with_reason() {
        let chain = vec![
            ancestor("a", Some(Tier::Gold), true),
            ancestor("b", Some(Tier::Silver), true),
            ancestor("c", Some(Tier::Silver), true),
        ];
        let calc = calculate("buyer", 10_000, &chain);
        assert_eq!(calc.payouts.len(), 2);
        let skip = &calc.skipped[0];
        assert_eq!(skip.user_id, "c");
        assert_eq!(skip.reason.to_string(), "package_silver_level_2_insufficient_for_layer_3");
    }

    #[test]
    fn buyer_in_chain_stops_processing() {
        let chain = vec![
            ancestor("a", Some(Tier::Titan), true),
            ancestor("buyer", Some(Tier::Titan), true),
            ancestor("z", Some(Tier::Titan), true),
        ];
        let calc = calculate("buyer", 10_000, &chain);
        assert_eq!(calc.payouts.len(), 1);
        assert_eq!(calc.skipped.len(), 1);
        assert_eq!(calc.skipped[0].reason, SkipReason::CircularReference);
        assert_eq!(calc.skipped[0].layer, 2);
    }

    #[test]
    fn every_layer_uses_the_canonical_rate() {
        let chain: Vec<_> = (0..10)
            .map(|i| ancestor(&format!("a{i}"), Some(Tier::Titan), true))
            .collect();
        let base = 123_457;
        let calc = calculate("buyer", base, &chain);
        assert_eq!(calc.payouts.len(), MAX_COMMISSION_DEPTH as usize);
        for payout in &calc.payouts {
            let rate = tiers::LAYER_RATES[payout.layer as usize - 1];
            assert_eq!(payout.rate, rate);
            assert_eq!(payout.amount, tiers::commission_amount(base, rate));
        }
    }

    #[test]
    fn zero_amounts_are_not_paid() {
        let chain = vec![ancestor("a", Some(Tier::Bronze), true)];
        let calc = calculate("buyer", 0, &chain);
        assert!(calc.payouts.is_empty());
        assert!(calc.skipped.is_empty());
    }

    #[test]
    fn random_chains_keep_layer_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let len = rng.gen_range(0..14);
            let chain: Vec<_> = (0..len)
                .map(|i| {
                    let tier = if rng.gen_bool(0.2) {
                        None
                    } else {
                        Some(Tier::ALL[rng.gen_range(0..Tier::ALL.len())])
                    };
                    // occasional repeated id to exercise the cycle guard
                    let id = if rng.gen_bool(0.05) { "dup".to_string() } else { format!("u{i}") };
                    ancestor(&id, tier, rng.gen_bool(0.8))
                })
                .collect();
            let base = rng.gen_range(0..1_000_000);
            let calc = calculate("buyer", base, &chain);

            let entries = calc.payouts.len() + calc.skipped.len();
            assert!(entries <= chain.len().min(MAX_COMMISSION_DEPTH as usize));

            let mut layers: Vec<u32> = calc.payouts.iter().map(|p| p.layer).collect();
            layers.extend(calc.skipped.iter().map(|s| s.layer));
            let unique: BTreeSet<u32> = layers.iter().copied().collect();
            assert_eq!(unique.len(), layers.len());
            assert!(layers.iter().all(|l| (1..=MAX_COMMISSION_DEPTH).contains(l)));
            for payout in &calc.payouts {
                assert!(payout.amount > 0);
                let anc = &chain[payout.layer as usize - 1];
                assert!(anc.current_package.unwrap().level() >= payout.layer);
            }
        }
    }
}
