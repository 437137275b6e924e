use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::commission::Payout;
use crate::graph::{self, Ancestor, UserGraph, UserId, UserSnapshot};
use crate::tiers::{self, Cents, RateMicro, Tier};

pub type RecordId = String;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown user {user}")]
    UnknownUser { user: UserId },
    #[error("user {user} already exists")]
    UserExists { user: UserId },
    #[error("tier of {user} changed concurrently (expected {expected:?}, found {found:?})")]
    StaleTier {
        user: UserId,
        expected: Option<Tier>,
        found: Option<Tier>,
    },
    #[error("Referrer already set")]
    ReferrerAlreadySet { user: UserId },
    #[error("Circular referral chain detected")]
    CircularReferral { user: UserId, referrer: UserId },
    #[error("duplicate commission record {id}")]
    DuplicateRecord { id: RecordId },
    #[error("injected fault at mutation {index}")]
    InjectedFault { index: usize },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
    Held,
    Reversed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionRecord {
    pub id: RecordId,
    pub beneficiary_user_id: UserId,
    pub referred_user_id: UserId,
    pub layer: u32,
    #[serde(rename = "rate_percent", with = "tiers::percent")]
    pub rate: RateMicro,
    pub amount_cents: Cents,
    pub status: CommissionStatus,
    pub source_revenue_event_id: String,
    pub notes: String,
    pub created_at: u64,
}

impl CommissionRecord {
    pub fn approved(payout: &Payout, revenue_event_id: &str, created_at: u64) -> Self {
        Self {
            id: record_id(revenue_event_id, &payout.beneficiary_user_id, payout.layer),
            beneficiary_user_id: payout.beneficiary_user_id.clone(),
            referred_user_id: payout.referred_user_id.clone(),
            layer: payout.layer,
            rate: payout.rate,
            amount_cents: payout.amount,
            status: CommissionStatus::Approved,
            source_revenue_event_id: revenue_event_id.to_string(),
            notes: payout.notes.clone(),
            created_at,
        }
    }
}

/// Deterministic id: one record per (event, beneficiary, layer).
pub fn record_id(revenue_event_id: &str, beneficiary: &str, layer: u32) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(b"commission");
    hasher.update((revenue_event_id.len() as u64).to_le_bytes());
    hasher.update(revenue_event_id.as_bytes());
    hasher.update((beneficiary.len() as u64).to_le_bytes());
    hasher.update(beneficiary.as_bytes());
    hasher.update(layer.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageUpgrade {
    pub user_id: UserId,
    pub from_package: Option<Tier>,
    pub to_package: Tier,
    pub from_price_cents: Cents,
    pub to_price_cents: Cents,
    pub difference_cents: Cents,
    pub created_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AffiliateStatus {
    pub tier: Tier,
    pub is_active: bool,
    pub tier_depth_limit: u32,
    pub updated_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub current_package: Option<Tier>,
    pub referred_by: Option<UserId>,
    pub package_activated_at: Option<u64>,
    pub affiliate_status: Option<AffiliateStatus>,
}

impl UserRecord {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            current_package: None,
            referred_by: None,
            package_activated_at: None,
            affiliate_status: None,
        }
    }

    pub fn with_package(mut self, tier: Tier, active: bool) -> Self {
        self.current_package = Some(tier);
        self.affiliate_status = Some(AffiliateStatus {
            tier,
            is_active: active,
            tier_depth_limit: tier.depth_limit(),
            updated_at: 0,
        });
        self
    }

    pub fn referred_by(mut self, referrer: impl Into<UserId>) -> Self {
        self.referred_by = Some(referrer.into());
        self
    }

    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id.clone(),
            current_package: self.current_package,
            referred_by: self.referred_by.clone(),
            is_active_affiliate: self
                .affiliate_status
                .as_ref()
                .map(|s| s.is_active)
                .unwrap_or(false),
        }
    }
}

/// One write inside an atomic batch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    InsertCommission(CommissionRecord),
    InsertUpgrade(PackageUpgrade),
    /// Fails the batch unless the user still holds `expected`.
    SetPackage {
        user_id: UserId,
        expected: Option<Tier>,
        package: Tier,
        activated_at: u64,
    },
    UpsertAffiliateStatus {
        user_id: UserId,
        status: AffiliateStatus,
    },
    /// Fails the batch unless the pointer is still unset.
    SetReferrer { user_id: UserId, referrer: UserId },
}

/// Transactional repository the engine writes through.
///
/// `apply` is all-or-nothing: after an error none of the batch is visible.
pub trait Ledger: UserGraph {
    /// Live price for `tier`, if the package table has one.
    fn package_price(&self, tier: Tier) -> Result<Option<Cents>, StoreError>;

    fn apply(&self, batch: &[LedgerMutation]) -> Result<(), StoreError>;

    fn commissions_for(&self, beneficiary: &str) -> Result<Vec<CommissionRecord>, StoreError>;

    fn commissions_for_event(&self, revenue_event_id: &str)
        -> Result<Vec<CommissionRecord>, StoreError>;

    fn upgrades_for(&self, user: &str) -> Result<Vec<PackageUpgrade>, StoreError>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreState {
    pub users: BTreeMap<UserId, UserRecord>,
    pub packages: BTreeMap<Tier, Cents>,
    pub commissions: Vec<CommissionRecord>,
    pub upgrades: Vec<PackageUpgrade>,
    #[serde(skip)]
    record_ids: BTreeSet<RecordId>,
}

impl StoreState {
    fn reindex(&mut self) {
        self.record_ids = self.commissions.iter().map(|r| r.id.clone()).collect();
    }

    fn user_mut(&mut self, id: &str) -> Result<&mut UserRecord, StoreError> {
        self.users
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownUser { user: id.to_string() })
    }

    fn apply_one(&mut self, mutation: &LedgerMutation) -> Result<(), StoreError> {
        match mutation {
            LedgerMutation::InsertCommission(record) => {
                if !self.record_ids.insert(record.id.clone()) {
                    return Err(StoreError::DuplicateRecord {
                        id: record.id.clone(),
                    });
                }
                self.commissions.push(record.clone());
            }
            LedgerMutation::InsertUpgrade(upgrade) => {
                self.user_mut(&upgrade.user_id)?;
                self.upgrades.push(upgrade.clone());
            }
            LedgerMutation::SetPackage {
                user_id,
                expected,
                package,
                activated_at,
            } => {
                let user = self.user_mut(user_id)?;
                if user.current_package != *expected {
                    return Err(StoreError::StaleTier {
                        user: user_id.clone(),
                        expected: *expected,
                        found: user.current_package,
                    });
                }
                user.current_package = Some(*package);
                user.package_activated_at = Some(*activated_at);
            }
            LedgerMutation::UpsertAffiliateStatus { user_id, status } => {
                self.user_mut(user_id)?.affiliate_status = Some(status.clone());
            }
            LedgerMutation::SetReferrer { user_id, referrer } => {
                if !self.users.contains_key(referrer) {
                    return Err(StoreError::UnknownUser {
                        user: referrer.clone(),
                    });
                }
                if self.user_mut(user_id)?.referred_by.is_some() {
                    return Err(StoreError::ReferrerAlreadySet {
                        user: user_id.clone(),
                    });
                }
                // rescanned under the write lock: the caller's scan may be stale
                if graph::creates_cycle(&*self, user_id, referrer)? {
                    return Err(StoreError::CircularReferral {
                        user: user_id.clone(),
                        referrer: referrer.clone(),
                    });
                }
                self.user_mut(user_id)?.referred_by = Some(referrer.clone());
            }
        }
        Ok(())
    }
}

impl UserGraph for StoreState {
    fn user(&self, id: &str) -> Result<Option<UserSnapshot>, StoreError> {
        Ok(self.users.get(id).map(UserRecord::snapshot))
    }
}

/// Thread-safe in-memory store with JSON file persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    fault_at: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(mut state: StoreState) -> Self {
        state.reindex();
        Self {
            state: RwLock::new(state),
            fault_at: Mutex::new(None),
        }
    }

    /// Loads a saved state file; a missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            debug!("no state file at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let state: StoreState = serde_json::from_slice(&bytes)?;
        Ok(Self::from_state(state))
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let state = self.snapshot()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        fs::rename(&tmp, path)?;
        info!(
            "saved {} users and {} commission records to {}",
            state.users.len(),
            state.commissions.len(),
            path.display()
        );
        Ok(())
    }

    pub fn snapshot(&self) -> Result<StoreState, StoreError> {
        Ok(self.state.read().map_err(|_| StoreError::Poisoned)?.clone())
    }

    pub fn insert_user(&self, user: UserRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        if state.users.contains_key(&user.id) {
            return Err(StoreError::UserExists { user: user.id });
        }
        state.users.insert(user.id.clone(), user);
        Ok(())
    }

    pub fn user_record(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.users.get(id).cloned())
    }

    pub fn set_package_price(&self, tier: Tier, price: Cents) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.packages.insert(tier, price);
        Ok(())
    }

    /// The `index`-th mutation of the next batch fails.
    pub fn fail_mutation_at(&self, index: usize) -> Result<(), StoreError> {
        *self.fault_at.lock().map_err(|_| StoreError::Poisoned)? = Some(index);
        Ok(())
    }

    /// Merkle root over all commission records, in insertion order.
    pub fn ledger_root(&self) -> Result<[u8; 32], StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(compute_ledger_root(&state.commissions))
    }
}

impl UserGraph for MemoryStore {
    fn user(&self, id: &str) -> Result<Option<UserSnapshot>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        state.user(id)
    }

    // One read lock for the whole chain.
    fn fetch_ancestors(&self, start: &str, max_depth: u32) -> Result<Vec<Ancestor>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        graph::walk_upline(&*state, start, max_depth)
    }
}

impl Ledger for MemoryStore {
    fn package_price(&self, tier: Tier) -> Result<Option<Cents>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.packages.get(&tier).copied())
    }

    fn apply(&self, batch: &[LedgerMutation]) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let fault = self.fault_at.lock().map_err(|_| StoreError::Poisoned)?.take();

        let mut staged = state.clone();
        for (index, mutation) in batch.iter().enumerate() {
            if fault == Some(index) {
                return Err(StoreError::InjectedFault { index });
            }
            staged.apply_one(mutation)?;
        }
        *state = staged;
        debug!("committed batch of {} mutations", batch.len());
        Ok(())
    }

    fn commissions_for(&self, beneficiary: &str) -> Result<Vec<CommissionRecord>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state
            .commissions
            .iter()
            .filter(|r| r.beneficiary_user_id == beneficiary)
            .cloned()
            .collect())
    }

    fn commissions_for_event(
        &self,
        revenue_event_id: &str,
    ) -> Result<Vec<CommissionRecord>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state
            .commissions
            .iter()
            .filter(|r| r.source_revenue_event_id == revenue_event_id)
            .cloned()
            .collect())
    }

    fn upgrades_for(&self, user: &str) -> Result<Vec<PackageUpgrade>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state
            .upgrades
            .iter()
            .filter(|u| u.user_id == user)
            .cloned()
            .collect())
    }
}

fn compute_ledger_root(records: &[CommissionRecord]) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = records
        .iter()
        .map(|record| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(b"record");
            hasher.update(record.id.as_bytes());
            hasher.update(record.beneficiary_user_id.as_bytes());
            hasher.update(record.amount_cents.to_le_bytes());
            hasher.update(record.rate.to_le_bytes());
            hasher.update(record.layer.to_le_bytes());
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"commission-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next: Vec<[u8; 32]> = Vec::with_capacity((leaves.len() + 1) / 2);
        for pair in leaves.chunks(2) {
            if let [left, right] = pair {
                let mut hasher = Sha256::new();
                hasher.update(b"pair");
                hasher.update(left);
                hasher.update(right);
                next.push(hasher.finalize().into());
            } else {
                // odd leaf is promoted as-is
                next.push(pair[0]);
            }
        }
        leaves = next;
    }
    leaves[0]
}
