//! Firewall configuration
//!
//! Loaded from JSON; every field has a default so an empty object is a
//! valid config:
//!
//! ```json
//! {
//!   "lock_timeout_secs": 5,
//!   "provider_key": "vpr-firewall-provider",
//!   "sublayer_key": "vpr-firewall-sublayer",
//!   "nft": { "table": "vpr_firewall", "binary": "nft", "priority": -100 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::compiler::validate_alias;
use crate::engine::{LockTimeout, Owner, DEFAULT_PROVIDER_KEY, DEFAULT_SUBLAYER_KEY};
use crate::error::{PolicyError, Result};

/// Top-level firewall configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Seconds to wait for the transaction lock; 0 uses the engine default
    #[serde(default)]
    pub lock_timeout_secs: u32,
    #[serde(default = "default_provider_key")]
    pub provider_key: String,
    #[serde(default = "default_sublayer_key")]
    pub sublayer_key: String,
    #[serde(default)]
    pub nft: NftConfig,
}

/// nftables backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftConfig {
    /// Table owned exclusively by the firewall
    #[serde(default = "default_table")]
    pub table: String,
    /// Path or name of the `nft` executable
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Base chain priority; negative runs before other tables
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_provider_key() -> String {
    DEFAULT_PROVIDER_KEY.to_string()
}

fn default_sublayer_key() -> String {
    DEFAULT_SUBLAYER_KEY.to_string()
}

fn default_table() -> String {
    "vpr_firewall".to_string()
}

fn default_binary() -> String {
    "nft".to_string()
}

fn default_priority() -> i32 {
    -100
}

impl Default for NftConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            binary: default_binary(),
            priority: default_priority(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 0,
            provider_key: default_provider_key(),
            sublayer_key: default_sublayer_key(),
            nft: NftConfig::default(),
        }
    }
}

impl FirewallConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Config(format!("read {}: {e}", path.display())))?;
        let config: FirewallConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider_key.trim().is_empty() || self.sublayer_key.trim().is_empty() {
            return Err(PolicyError::Config(
                "provider and sublayer keys must not be empty".into(),
            ));
        }
        if self.provider_key == self.sublayer_key {
            return Err(PolicyError::Config(
                "provider and sublayer keys must differ".into(),
            ));
        }
        let table_ok = !self.nft.table.is_empty()
            && self
                .nft
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !table_ok {
            return Err(PolicyError::Config(format!(
                "invalid nftables table name: {:?}",
                self.nft.table
            )));
        }
        validate_alias("nft binary", &self.nft.binary)
            .map_err(|e| PolicyError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn with_lock_timeout_secs(mut self, secs: u32) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    pub fn lock_timeout(&self) -> LockTimeout {
        LockTimeout::from_secs(self.lock_timeout_secs)
    }

    pub fn owner(&self) -> Owner {
        Owner::new(self.provider_key.clone(), self.sublayer_key.clone())
    }
}
