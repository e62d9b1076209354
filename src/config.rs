//! Execution configuration.

use crate::error::ConfigError;
use alloy_primitives::{address, Address, U256};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Default module account that receives transaction fees.
pub const DEFAULT_FEE_COLLECTOR: Address = address!("00000000000000000000000000000000000fee00");

/// Recoverers whose result buffer grew beyond this are not pooled.
pub const DEFAULT_MAX_POOLED_RECOVERERS: usize = 8192;

/// Configuration for block execution.
///
/// The two path flags feed the execution path selector:
///
/// | giga | occ | path |
/// |------|-----|------|
/// | yes  | yes | fast, falling back to OCC |
/// | yes  | no  | fast, falling back to sequential |
/// | no   | yes | OCC |
/// | no   | no  | sequential |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Chain id expected in virtual machine transactions.
    pub chain_id: u64,
    /// Enable the dependency-signalled fast concurrent path.
    pub giga_enabled: bool,
    /// Enable the optimistic (OCC) concurrent path.
    pub occ_enabled: bool,
    /// Worker threads for the concurrent execution paths.
    pub concurrency_workers: usize,
    /// Parallel preprocessing workers in the block pipeline.
    pub preprocess_workers: usize,
    /// Threads in the sender recovery pool.
    pub recovery_threads: usize,
    /// Capacity of every bounded inter-stage channel.
    pub channel_capacity: usize,
    /// How long the confirming call waits for a speculative result.
    pub optimistic_timeout_ms: u64,
    /// Maximum gas per block; 0 disables the limit.
    pub block_max_gas: u64,
    /// Base fee per gas for virtual machine transactions.
    pub base_fee: U256,
    /// Account credited with deferred fees at the end of each batch.
    pub fee_collector: Address,
    /// Size ceiling for recoverers returned to the pool.
    pub max_pooled_recoverers: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            chain_id: 1,
            giga_enabled: false,
            occ_enabled: true,
            concurrency_workers: cores,
            preprocess_workers: (cores / 2).max(1),
            recovery_threads: cores,
            channel_capacity: 4,
            optimistic_timeout_ms: 5_000,
            block_max_gas: 0,
            base_fee: U256::ZERO,
            fee_collector: DEFAULT_FEE_COLLECTOR,
            max_pooled_recoverers: DEFAULT_MAX_POOLED_RECOVERERS,
        }
    }
}

impl ExecutionConfig {
    /// Minimal configuration (for testing): one thread everywhere.
    pub fn minimal() -> Self {
        Self {
            concurrency_workers: 1,
            preprocess_workers: 1,
            recovery_threads: 1,
            channel_capacity: 1,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("concurrency_workers", self.concurrency_workers),
            ("preprocess_workers", self.preprocess_workers),
            ("recovery_threads", self.recovery_threads),
            ("channel_capacity", self.channel_capacity),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.optimistic_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "optimistic_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_millis(self.optimistic_timeout_ms)
    }

    /// Block gas limit, `None` when unlimited.
    pub fn max_gas(&self) -> Option<u64> {
        (self.block_max_gas > 0).then_some(self.block_max_gas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ExecutionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimistic_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_gas(), None);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ExecutionConfig {
            preprocess_workers: 0,
            ..ExecutionConfig::minimal()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
