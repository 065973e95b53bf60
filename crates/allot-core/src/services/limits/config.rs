//! Limit definitions and external collaborators
//!
//! A [`LimitDefinition`] describes one limit type. The engine consumes three
//! collaborators through traits: [`ConfigResolver`] (tier allowance),
//! [`GuestIdentity`] (guest detection) and [`Clock`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Allowance, ResetPeriod};
use crate::error::{Error, Result};

// ============================================================================
// Limit Definition
// ============================================================================

/// Maps a membership tier to its base allowance
pub type MembershipLimitFn = fn(&str) -> Allowance;

/// Header keys of the user document; a limit field may not reuse them
pub const RESERVED_FIELD_NAMES: [&str; 3] = ["userId", "createdAt", "updatedAt"];

/// Rate limits on ad grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdPolicy {
    /// Ad grants allowed per UTC day
    pub daily_limit: u32,
    /// Minimum seconds between two ad grants
    pub cooldown_secs: i64,
}

impl Default for AdPolicy {
    fn default() -> Self {
        Self {
            daily_limit: 10,
            cooldown_secs: 300,
        }
    }
}

/// Everything needed to build one limit service
#[derive(Debug, Clone)]
pub struct LimitDefinition {
    /// Name used in logs
    pub service_name: String,
    /// User-facing label used in error messages
    pub limit_type: String,
    pub membership_limit: MembershipLimitFn,
    /// Allowance for test accounts; falls back to the tier allowance
    pub test_account_limit: Option<Allowance>,
    pub reset_period: ResetPeriod,
    pub per_character: bool,
    pub allow_guest: bool,
    /// Top-level key in the aggregate document; required
    pub field_name: Option<String>,
    pub ad_policy: Option<AdPolicy>,
}

impl LimitDefinition {
    pub fn new(service_name: impl Into<String>, limit_type: impl Into<String>, membership_limit: MembershipLimitFn) -> Self {
        Self {
            service_name: service_name.into(),
            limit_type: limit_type.into(),
            membership_limit,
            test_account_limit: None,
            reset_period: ResetPeriod::Monthly,
            per_character: false,
            allow_guest: false,
            field_name: None,
            ad_policy: None,
        }
    }

    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    pub fn with_reset_period(mut self, period: ResetPeriod) -> Self {
        self.reset_period = period;
        self
    }

    pub fn per_character(mut self) -> Self {
        self.per_character = true;
        self
    }

    pub fn allow_guest(mut self) -> Self {
        self.allow_guest = true;
        self
    }

    pub fn with_test_account_limit(mut self, limit: Allowance) -> Self {
        self.test_account_limit = Some(limit);
        self
    }

    pub fn with_ad_policy(mut self, policy: AdPolicy) -> Self {
        self.ad_policy = Some(policy);
        self
    }

    /// Check the definition and return the storage field name
    pub fn validate(&self) -> Result<&str> {
        match self.field_name.as_deref().map(str::trim) {
            Some(name) if name.contains('.') => Err(Error::config(format!(
                "fieldName '{}' must not contain '.' (service: {})",
                name, self.service_name
            ))),
            Some(name) if RESERVED_FIELD_NAMES.contains(&name) => Err(Error::config(format!(
                "fieldName '{}' is reserved by the user document (service: {})",
                name, self.service_name
            ))),
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(Error::config(format!(
                "fieldName is required (service: {})",
                self.service_name
            ))),
        }
    }
}

// ============================================================================
// Config Resolver
// ============================================================================

/// Allowance resolved for one user and limit type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitConfig {
    pub tier: String,
    pub limit: Allowance,
    /// Tier allowance before test-account overrides
    pub standard_limit: Allowance,
    pub is_test_account: bool,
}

/// Resolves the numeric allowance for a user's tier
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, user_id: &str, definition: &LimitDefinition) -> Result<LimitConfig>;
}

/// In-memory tier directory
///
/// Users without an explicit assignment get the default tier.
#[derive(Debug, Clone)]
pub struct StaticConfigResolver {
    default_tier: String,
    tiers: HashMap<String, String>,
    test_accounts: HashSet<String>,
}

impl StaticConfigResolver {
    pub fn new(default_tier: impl Into<String>) -> Self {
        Self {
            default_tier: default_tier.into(),
            tiers: HashMap::new(),
            test_accounts: HashSet::new(),
        }
    }

    pub fn with_user_tier(mut self, user_id: impl Into<String>, tier: impl Into<String>) -> Self {
        self.tiers.insert(user_id.into(), tier.into());
        self
    }

    pub fn with_test_account(mut self, user_id: impl Into<String>) -> Self {
        self.test_accounts.insert(user_id.into());
        self
    }

    pub fn tier_of(&self, user_id: &str) -> &str {
        self.tiers
            .get(user_id)
            .map(String::as_str)
            .unwrap_or(&self.default_tier)
    }
}

impl Default for StaticConfigResolver {
    fn default() -> Self {
        Self::new("free")
    }
}

#[async_trait]
impl ConfigResolver for StaticConfigResolver {
    async fn resolve(&self, user_id: &str, definition: &LimitDefinition) -> Result<LimitConfig> {
        let tier = self.tier_of(user_id).to_string();
        let standard_limit = (definition.membership_limit)(&tier);
        let is_test_account = self.test_accounts.contains(user_id);
        let limit = match (is_test_account, definition.test_account_limit) {
            (true, Some(test_limit)) => test_limit,
            _ => standard_limit,
        };

        Ok(LimitConfig {
            tier,
            limit,
            standard_limit,
            is_test_account,
        })
    }
}

// ============================================================================
// Guest Identity
// ============================================================================

/// Recognises the designated guest identity
pub trait GuestIdentity: Send + Sync {
    fn is_guest(&self, user_id: &str) -> bool;
}

/// Fixed set of guest user ids
#[derive(Debug, Clone)]
pub struct DesignatedGuests {
    ids: HashSet<String>,
}

impl DesignatedGuests {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for DesignatedGuests {
    fn default() -> Self {
        Self::new(["guest"])
    }
}

impl GuestIdentity for DesignatedGuests {
    fn is_guest(&self, user_id: &str) -> bool {
        self.ids.contains(user_id)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Time source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
