use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ledger::{MemoryStore, StoreError};
use crate::tiers::{Cents, Tier};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub state_path: PathBuf,
    pub log_level: String,
    /// Live package prices in cents, overriding the built-in table.
    pub prices: BTreeMap<Tier, Cents>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("affiliate-state.json"),
            log_level: "info".to_string(),
            prices: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Opens the state file and installs the configured prices.
    pub fn open_store(&self) -> Result<MemoryStore, StoreError> {
        let store = MemoryStore::load(&self.state_path)?;
        for (tier, price) in &self.prices {
            store.set_package_price(*tier, *price)?;
        }
        Ok(store)
    }
}
