use thiserror::Error;

use crate::graph::UserId;
use crate::ledger::StoreError;
use crate::tiers::Tier;

/// Every way an engine operation can fail.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid tier")]
    InvalidTier(String),

    #[error("Cannot refer yourself")]
    SelfReferral,

    #[error("Referrer already set")]
    ReferrerAlreadySet,

    #[error("Circular referral chain detected")]
    CircularReferral,

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Same tier or lower: upgrades only move up.
    #[error("Not an upgrade: {from} (level {from_level}) to {to} (level {to_level})")]
    NotAnUpgrade {
        from: Tier,
        from_level: u32,
        to: Tier,
        to_level: u32,
    },

    #[error("Price difference must be positive (from {from_price} to {to_price} cents)")]
    NonPositiveDifference { from_price: u64, to_price: u64 },

    #[error("No price available for tier {0}")]
    PriceUnavailable(Tier),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Caller errors: retrying the same request cannot succeed.
    pub fn is_validation(&self) -> bool {
        !matches!(self, EngineError::Store(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
