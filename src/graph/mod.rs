//! Upline traversal over the single-parent "referred-by" graph.

use std::collections::BTreeSet;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::ledger::StoreError;
use crate::tiers::Tier;

pub type UserId = String;

/// Point-in-time view of a user as the engine needs it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSnapshot {
    pub id: UserId,
    pub current_package: Option<Tier>,
    pub referred_by: Option<UserId>,
    pub is_active_affiliate: bool,
}

/// An upline member as seen from one buyer.
pub type Ancestor = UserSnapshot;

/// Read capability over users and their upline pointers.
pub trait UserGraph {
    fn user(&self, id: &str) -> Result<Option<UserSnapshot>, StoreError>;

    /// Ordered ancestors of `start`, nearest first.
    ///
    /// The default walks one lookup per ancestor; a store may answer it
    /// with a single batched query as long as the result is identical.
    fn fetch_ancestors(&self, start: &str, max_depth: u32) -> Result<Vec<Ancestor>, StoreError> {
        walk_upline(self, start, max_depth)
    }
}

/// Follows `referred_by` upward from `start`.
///
/// Stops at the root, at `max_depth` ancestors, or before revisiting a user.
/// A pointer to a user that no longer exists ends the chain.
pub fn walk_upline<G>(graph: &G, start: &str, max_depth: u32) -> Result<Vec<Ancestor>, StoreError>
where
    G: UserGraph + ?Sized,
{
    let mut chain = Vec::new();
    let mut visited = BTreeSet::new();
    visited.insert(start.to_string());

    let mut next = match graph.user(start)? {
        Some(user) => user.referred_by,
        None => return Ok(chain),
    };

    while let Some(parent) = next {
        if chain.len() as u32 >= max_depth {
            break;
        }
        if visited.contains(&parent) {
            warn!(
                "referral cycle above {start}: {parent} already visited after {} ancestors",
                chain.len()
            );
            break;
        }
        let Some(snapshot) = graph.user(&parent)? else {
            debug!("upline of {start} truncated at missing user {parent}");
            break;
        };
        visited.insert(parent);
        next = snapshot.referred_by.clone();
        chain.push(snapshot);
    }
    Ok(chain)
}

/// True when making `referrer` the upline of `user` would close a loop,
/// i.e. `user` already appears above `referrer`.
pub fn creates_cycle<G>(graph: &G, user: &str, referrer: &str) -> Result<bool, StoreError>
where
    G: UserGraph + ?Sized,
{
    let mut visited = BTreeSet::new();
    visited.insert(user.to_string());
    let mut current = Some(referrer.to_string());
    while let Some(id) = current {
        if !visited.insert(id.clone()) {
            return Ok(true);
        }
        current = match graph.user(&id)? {
            Some(snapshot) => snapshot.referred_by,
            None => None,
        };
    }
    Ok(false)
}
