//! Multi-level referral commission engine.
//!
//! Users refer other users; when a referred user buys or upgrades a tiered
//! package, a share of the price is paid up the referral chain. The crate is
//! split into small pieces that the [`engine::Engine`] façade composes:
//!
//! * [`graph`]: upline walk over the single-parent "referred-by" pointer,
//!   with cycle detection and tolerance for deleted accounts.
//! * [`commission`]: eligibility rule and the pure payout calculator.
//! * [`ledger`]: ledger rows, the transactional [`ledger::Ledger`] trait and
//!   an in-memory store that applies each batch all-or-nothing.
//! * [`distributor`], [`upgrade`], [`referrer`], [`simulator`]: the
//!   operations themselves.
//! * [`tiers`]: tier/level/rate tables and cent-exact money helpers.

pub mod commission;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod graph;
pub mod ledger;
pub mod referrer;
pub mod simulator;
pub mod tiers;
pub mod upgrade;

mod error;

pub use engine::{CommissionResult, Engine, ReferrerResult, UpgradeResult};
pub use error::{EngineError, EngineResult};
pub use tiers::{Tier, MAX_COMMISSION_DEPTH};
