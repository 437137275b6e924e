use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// USD amounts in cents.
pub type Cents = u64;

/// Rates in millionths of a percent (10% = 10_000_000).
pub type RateMicro = u64;

pub const CENTS_PER_USD: Cents = 100;
pub const RATE_SCALE: u64 = 1_000_000; // 1% = 1e6 micro-percent

pub const MAX_COMMISSION_DEPTH: u32 = 8;

/// Commission rate per layer, index 0 = layer 1.
pub const LAYER_RATES: [RateMicro; MAX_COMMISSION_DEPTH as usize] = [
    10_000_000, // 10%
    5_000_000,  // 5%
    2_500_000,  // 2.5%
    1_250_000,  // 1.25%
    625_000,    // 0.625%
    317_500,    // 0.3175%
    158_750,    // 0.15875%
    79_375,     // 0.079375%
];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
    // Reserved: present in the level and rate tables, not sold yet.
    Elite,
    Legend,
    Titan,
}

impl Tier {
    pub const ALL: [Tier; 8] = [
        Tier::Bronze,
        Tier::Silver,
        Tier::Gold,
        Tier::Platinum,
        Tier::Diamond,
        Tier::Elite,
        Tier::Legend,
        Tier::Titan,
    ];

    /// Numeric level used for the `level >= layer` eligibility check.
    pub fn level(self) -> u32 {
        match self {
            Tier::Bronze => 1,
            Tier::Silver => 2,
            Tier::Gold => 3,
            Tier::Platinum => 4,
            Tier::Diamond => 5,
            Tier::Elite => 6,
            Tier::Legend => 7,
            Tier::Titan => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
            Tier::Diamond => "diamond",
            Tier::Elite => "elite",
            Tier::Legend => "legend",
            Tier::Titan => "titan",
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Tier::Elite | Tier::Legend | Tier::Titan)
    }

    /// Hard-coded price used when the live price source has no entry.
    pub fn fallback_price(self) -> Option<Cents> {
        let usd = match self {
            Tier::Bronze => 100,
            Tier::Silver => 250,
            Tier::Gold => 500,
            Tier::Platinum => 1_000,
            Tier::Diamond => 2_500,
            Tier::Elite | Tier::Legend | Tier::Titan => return None,
        };
        Some(usd * CENTS_PER_USD)
    }

    /// Layers this tier may earn on.
    pub fn depth_limit(self) -> u32 {
        self.level().min(MAX_COMMISSION_DEPTH)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier {0:?}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == wanted)
            .ok_or_else(|| UnknownTier(s.to_string()))
    }
}

/// Canonical rate for a 1-indexed layer, `None` past the table.
pub fn layer_rate(layer: u32) -> Option<RateMicro> {
    if layer == 0 {
        return None;
    }
    LAYER_RATES.get(layer as usize - 1).copied()
}

/// `round(base * rate / 100)` to whole cents, half up.
pub fn commission_amount(base: Cents, rate: RateMicro) -> Cents {
    let denom = 100u128 * RATE_SCALE as u128;
    let scaled = base as u128 * rate as u128 + denom / 2;
    (scaled / denom) as Cents
}

pub fn format_usd(cents: Cents) -> String {
    format!("${}.{:02}", cents / CENTS_PER_USD, cents % CENTS_PER_USD)
}

pub fn format_rate(rate: RateMicro) -> String {
    let whole = rate / RATE_SCALE;
    let frac = rate % RATE_SCALE;
    if frac == 0 {
        return format!("{whole}%");
    }
    let digits = format!("{frac:06}");
    format!("{whole}.{}%", digits.trim_end_matches('0'))
}

/// Serde helper: rates travel as percent floats (`2.5`) on the wire.
pub mod percent {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{RateMicro, RATE_SCALE};

    pub fn serialize<S>(value: &RateMicro, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(*value as f64 / RATE_SCALE as f64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<RateMicro, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pct = f64::deserialize(deserializer)?;
        if !pct.is_finite() || pct < 0.0 {
            return Err(serde::de::Error::custom("rate must be a non-negative percent"));
        }
        Ok((pct * RATE_SCALE as f64).round() as RateMicro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_declaration_order() {
        for (idx, tier) in Tier::ALL.iter().enumerate() {
            assert_eq!(tier.level(), idx as u32 + 1);
        }
        assert_eq!(Tier::ALL.len() as u32, MAX_COMMISSION_DEPTH);
    }

    #[test]
    fn rate_table_is_exact() {
        assert_eq!(layer_rate(0), None);
        assert_eq!(layer_rate(1), Some(10_000_000));
        assert_eq!(layer_rate(6), Some(317_500));
        assert_eq!(layer_rate(8), Some(79_375));
        assert_eq!(layer_rate(9), None);
        assert_eq!(format_rate(LAYER_RATES[7]), "0.079375%");
        assert_eq!(format_rate(LAYER_RATES[0]), "10%");
    }

    #[test]
    fn amount_rounds_half_up_to_cents() {
        // $500 at 10% and 5%
        assert_eq!(commission_amount(50_000, 10_000_000), 5_000);
        assert_eq!(commission_amount(50_000, 5_000_000), 2_500);
        // $100 * 0.079375% = $0.079375 -> $0.08
        assert_eq!(commission_amount(10_000, 79_375), 8);
        // $1 * 0.625% = $0.00625 -> $0.01
        assert_eq!(commission_amount(100, 625_000), 1);
        // $0.01 * 0.3175% rounds to zero
        assert_eq!(commission_amount(1, 317_500), 0);
    }

    #[test]
    fn amount_is_nearest_cent_for_every_rate() {
        let denom = 100 * RATE_SCALE as i128;
        for base in [100u64, 999, 10_000, 25_000, 240_000, 1_234_567] {
            for rate in LAYER_RATES {
                let exact = base as i128 * rate as i128;
                let paid = commission_amount(base, rate) as i128 * denom;
                let diff = paid - exact;
                // within half a cent, ties rounded up
                assert!(-denom / 2 < diff && diff <= denom / 2, "{base} @ {rate}");
            }
        }
        // $2400 at 0.079375% is exactly $1.905
        assert_eq!(commission_amount(240_000, 79_375), 191);
    }

    #[test]
    fn parse_is_case_insensitive_and_rejects_unknown() {
        assert_eq!("Diamond".parse::<Tier>().unwrap(), Tier::Diamond);
        assert_eq!(" titan ".parse::<Tier>().unwrap(), Tier::Titan);
        assert!("copper".parse::<Tier>().is_err());
    }

    #[test]
    fn reserved_tiers_have_no_fallback_price() {
        assert_eq!(Tier::Bronze.fallback_price(), Some(10_000));
        assert_eq!(Tier::Diamond.fallback_price(), Some(250_000));
        for tier in Tier::ALL {
            assert_eq!(tier.is_reserved(), tier.fallback_price().is_none());
        }
        assert_eq!(format_usd(250_005), "$2500.05");
    }
}
