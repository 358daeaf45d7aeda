//! Construction-time configuration (spec §6).
//!
//! All options are supplied once, at construction; there is no on-disk
//! layout or CLI surface for them (Non-goal, see SPEC_FULL.md §6).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Caps and limits enforced by [`crate::mempool::Mempool::select_for_mining`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Hard cap on the number of transactions returned by `select_for_mining`.
    pub max_transactions_for_mining: usize,
    /// Byte cap on the total size of transactions returned by `select_for_mining`.
    pub max_block_size_for_mining: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            max_transactions_for_mining: 10_000,
            max_block_size_for_mining: 4 * 1024 * 1024,
        }
    }
}

/// Effective mempool configuration. Serializable so a snapshot can carry the
/// configuration that produced it (spec §4.9) for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Protector global cap (entries). `0` disables the protector.
    pub max_size: usize,
    /// Byte ceiling triggering cleanup + eviction.
    pub memory_limit: u64,
    /// Per-transaction byte ceiling; admission reject above this.
    pub max_tx_size: u64,
    /// Pending TTL; exceeding it transitions an entry to Expired.
    pub lifetime: Duration,
    /// Retain locally-submitted entries under memory pressure (preferred in
    /// eviction scoring).
    pub keep_locals: bool,
    /// Enable periodic metrics emission.
    pub metrics_enabled: bool,
    /// Interval between metrics emissions, when enabled.
    pub metrics_interval: Duration,
    /// Mining-selection caps.
    pub mining: MiningConfig,
    /// Minimum per-byte fee rate used by fee estimation.
    pub price_limit: u64,
    /// Price-bump percentage required for a future replace-by-fee feature.
    pub price_bump: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            memory_limit: 300 * 1024 * 1024,
            max_tx_size: 100 * 1024,
            lifetime: Duration::from_secs(72 * 3600),
            keep_locals: true,
            metrics_enabled: false,
            metrics_interval: Duration::from_secs(60),
            mining: MiningConfig::default(),
            price_limit: 1000,
            price_bump: 10,
        }
    }
}

impl Config {
    /// Validates the configuration, returning a human-readable reason on
    /// failure. Used both at construction and by `update_config`.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tx_size == 0 {
            return Err("max_tx_size must be > 0".into());
        }
        if self.memory_limit == 0 {
            return Err("memory_limit must be > 0".into());
        }
        if self.mining.max_transactions_for_mining == 0 {
            return Err("mining.max_transactions_for_mining must be > 0".into());
        }
        if self.mining.max_block_size_for_mining == 0 {
            return Err("mining.max_block_size_for_mining must be > 0".into());
        }
        if self.price_bump > 100 {
            return Err("price_bump must be a percentage in [0, 100]".into());
        }
        Ok(())
    }
}
