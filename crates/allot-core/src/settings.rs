//! Engine settings
//!
//! Tunables shared by every limit service built from one factory.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default read-through cache capacity (entries)
pub const DEFAULT_CACHE_CAPACITY: u64 = 5_000;
/// Default sliding TTL for cached records
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;
/// Default attempts per transaction before giving up on conflicts
pub const DEFAULT_TX_ATTEMPTS: u32 = 5;

const MIN_CACHE_CAPACITY: u64 = 1;
const MIN_CACHE_TTL_SECS: u64 = 1;
const MIN_TX_ATTEMPTS: u32 = 1;
const MAX_TX_ATTEMPTS: u32 = 50;

pub const ENV_CACHE_CAPACITY: &str = "ALLOT_CACHE_CAPACITY";
pub const ENV_CACHE_TTL_SECS: &str = "ALLOT_CACHE_TTL_SECS";
pub const ENV_TX_ATTEMPTS: &str = "ALLOT_TX_ATTEMPTS";

/// Cache and transaction tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum cached records per service
    pub cache_capacity: u64,
    /// Idle time after which a cached record is dropped
    pub cache_ttl_secs: u64,
    /// Conflict retries per transaction
    pub max_transaction_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_transaction_attempts: DEFAULT_TX_ATTEMPTS,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by `ALLOT_*` environment variables, validated
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_capacity: env_or(ENV_CACHE_CAPACITY, defaults.cache_capacity),
            cache_ttl_secs: env_or(ENV_CACHE_TTL_SECS, defaults.cache_ttl_secs),
            max_transaction_attempts: env_or(ENV_TX_ATTEMPTS, defaults.max_transaction_attempts),
        }
        .validate()
    }

    /// Clamp values to their valid ranges
    pub fn validate(&self) -> Self {
        Self {
            cache_capacity: self.cache_capacity.max(MIN_CACHE_CAPACITY),
            cache_ttl_secs: self.cache_ttl_secs.max(MIN_CACHE_TTL_SECS),
            max_transaction_attempts: self
                .max_transaction_attempts
                .clamp(MIN_TX_ATTEMPTS, MAX_TX_ATTEMPTS),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("[settings] Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
