use log::{info, trace};

use crate::error::{EngineError, EngineResult};
use crate::graph;
use crate::ledger::{Ledger, LedgerMutation, StoreError};

/// Binds `referrer_id` as the upline of `user_id`, once.
///
/// The pointer can never be changed afterwards. The store re-checks that it
/// is unset and that no loop forms inside the write, so racing calls cannot
/// both succeed or close a cycle between them.
pub fn assign<L>(ledger: &L, user_id: &str, referrer_id: &str) -> EngineResult<()>
where
    L: Ledger + ?Sized,
{
    trace!("binding referrer {referrer_id} for {user_id}");
    if user_id == referrer_id {
        return Err(EngineError::SelfReferral);
    }

    let user = ledger
        .user(user_id)?
        .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;
    if ledger.user(referrer_id)?.is_none() {
        return Err(EngineError::UserNotFound(referrer_id.to_string()));
    }
    if user.referred_by.is_some() {
        return Err(EngineError::ReferrerAlreadySet);
    }
    if graph::creates_cycle(ledger, user_id, referrer_id)? {
        return Err(EngineError::CircularReferral);
    }

    let batch = [LedgerMutation::SetReferrer {
        user_id: user_id.to_string(),
        referrer: referrer_id.to_string(),
    }];
    match ledger.apply(&batch) {
        Ok(()) => {
            info!("{user_id} referred by {referrer_id}");
            Ok(())
        }
        Err(StoreError::ReferrerAlreadySet { .. }) => Err(EngineError::ReferrerAlreadySet),
        Err(StoreError::CircularReferral { .. }) => Err(EngineError::CircularReferral),
        Err(err) => Err(err.into()),
    }
}
