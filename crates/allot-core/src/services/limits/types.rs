//! Entitlement data model
//!
//! Types persisted inside the per-user aggregate document, one
//! [`EntitlementRecord`] per limit type (and character, when tracked per
//! character).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Maximum entries kept in `history` and `usageHistory`
pub const HISTORY_CAP: usize = 100;

/// Lifetime of a single ad grant
pub const AD_GRANT_TTL_HOURS: i64 = 24;

/// Default length of a temporary override, in days
pub const DEFAULT_UNLOCK_DAYS: u32 = 7;

// ============================================================================
// Reset Period
// ============================================================================

/// Cadence at which the recurring counter returns to zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    /// Never resets
    #[default]
    None,
    Daily,
    /// Monday-anchored weeks
    Weekly,
    Monthly,
    /// Never resets; counts accumulate for the account's lifetime
    Lifetime,
}

impl std::fmt::Display for ResetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetPeriod::None => write!(f, "none"),
            ResetPeriod::Daily => write!(f, "daily"),
            ResetPeriod::Weekly => write!(f, "weekly"),
            ResetPeriod::Monthly => write!(f, "monthly"),
            ResetPeriod::Lifetime => write!(f, "lifetime"),
        }
    }
}

impl std::str::FromStr for ResetPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "never" => Ok(ResetPeriod::None),
            "daily" | "day" => Ok(ResetPeriod::Daily),
            "weekly" | "week" => Ok(ResetPeriod::Weekly),
            "monthly" | "month" => Ok(ResetPeriod::Monthly),
            "lifetime" => Ok(ResetPeriod::Lifetime),
            _ => Err(format!("Unknown reset period: {}", s)),
        }
    }
}

// ============================================================================
// Allowance
// ============================================================================

/// A quota size. Persisted and reported as an integer where `-1` means
/// unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", from = "i64")]
pub enum Allowance {
    Unlimited,
    Limited(u32),
}

impl Allowance {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Allowance::Unlimited)
    }

    /// Integer form, `-1` for unlimited
    pub fn as_i64(&self) -> i64 {
        match self {
            Allowance::Unlimited => -1,
            Allowance::Limited(n) => i64::from(*n),
        }
    }
}

impl From<Allowance> for i64 {
    fn from(value: Allowance) -> Self {
        value.as_i64()
    }
}

impl From<i64> for Allowance {
    fn from(value: i64) -> Self {
        if value < 0 {
            Allowance::Unlimited
        } else {
            Allowance::Limited(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl std::fmt::Display for Allowance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Allowance::Unlimited => write!(f, "unlimited"),
            Allowance::Limited(n) => write!(f, "{}", n),
        }
    }
}

// ============================================================================
// Grants
// ============================================================================

/// A bonus on top of the tier allowance. Stored in `unlockHistory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unlockType")]
pub enum Grant {
    /// Time-boxed bonus earned by watching an ad
    #[serde(rename = "ad", rename_all = "camelCase")]
    Ad {
        amount: u32,
        unlocked_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// Permanent addon; `purchased_at` is absent for migrated legacy cards
    #[serde(rename = "purchase", rename_all = "camelCase")]
    PurchasedAddon {
        amount: u32,
        #[serde(default)]
        purchased_at: Option<DateTime<Utc>>,
    },
}

impl Grant {
    /// New ad grant valid for [`AD_GRANT_TTL_HOURS`]
    pub fn ad(amount: u32, now: DateTime<Utc>) -> Self {
        Grant::Ad {
            amount,
            unlocked_at: now,
            expires_at: now + Duration::hours(AD_GRANT_TTL_HOURS),
        }
    }

    pub fn amount(&self) -> u32 {
        match self {
            Grant::Ad { amount, .. } | Grant::PurchasedAddon { amount, .. } => *amount,
        }
    }

    /// Whether the grant still contributes to the allowance at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            Grant::Ad { expires_at, .. } => *expires_at > now,
            Grant::PurchasedAddon { .. } => true,
        }
    }
}

// ============================================================================
// History
// ============================================================================

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Rollback,
    AdUnlock,
    CardPurchase,
    TemporaryUnlock,
    PermanentUnlock,
    CountAdjusted,
}

/// Audit trail entry in `history`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, timestamp: DateTime<Utc>) -> Self {
        Self {
            action,
            timestamp,
            amount: None,
            previous_count: None,
            new_count: None,
            idempotency_key: None,
            reason: None,
        }
    }

    pub fn with_amount(mut self, amount: u32) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_counts(mut self, previous: u32, new: u32) -> Self {
        self.previous_count = Some(previous);
        self.new_count = Some(new);
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

/// Caller-supplied context attached to a recorded use
pub type UsageMetadata = serde_json::Map<String, serde_json::Value>;

/// Entry in `usageHistory`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    /// Handed back to the caller; reusable as a rollback idempotency key
    #[serde(rename = "eventId", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    /// Caller context, nested under `metadata` and never merged into the event
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: UsageMetadata,
}

/// Push onto a bounded list, dropping the oldest entries past [`HISTORY_CAP`]
pub(crate) fn push_capped<T>(list: &mut Vec<T>, item: T) {
    list.push(item);
    if list.len() > HISTORY_CAP {
        let excess = list.len() - HISTORY_CAP;
        list.drain(..excess);
    }
}

// ============================================================================
// Entitlement Record
// ============================================================================

/// Persisted quota state for one user × limit type (× character)
///
/// Missing fields in stored documents fall back to their defaults, so records
/// written by older versions load cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntitlementRecord {
    /// Uses consumed in the current period
    pub count: u32,
    /// Historical total, never reset
    pub lifetime_count: u32,
    /// Legacy cumulative ad-grant total, display only
    pub(crate) unlocked: u32,
    /// Legacy permanent addon count, kept equal to the addon grant sum
    pub(crate) cards: u32,
    pub permanent_unlock: bool,
    pub temporary_unlock_until: Option<DateTime<Utc>>,
    /// Period key of the last rollover
    pub last_reset_date: Option<String>,
    pub last_ad_time: Option<DateTime<Utc>>,
    pub ads_watched_today: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(rename = "unlockHistory")]
    pub grants: Vec<Grant>,
    pub history: Vec<HistoryEntry>,
    pub usage_history: Vec<UsageEvent>,
}

impl EntitlementRecord {
    /// Legacy cumulative ad-grant counter; never used for allowance math
    pub fn legacy_unlocked(&self) -> u32 {
        self.unlocked
    }

    /// Permanent addon total, computed from the grant list
    pub fn cards(&self) -> u32 {
        self.grants
            .iter()
            .filter(|g| matches!(g, Grant::PurchasedAddon { .. }))
            .map(Grant::amount)
            .sum()
    }

    /// Sum of unexpired ad grants at `now`
    pub fn active_ad_grants(&self, now: DateTime<Utc>) -> u32 {
        self.grants
            .iter()
            .filter(|g| matches!(g, Grant::Ad { .. }) && g.is_active(now))
            .map(Grant::amount)
            .sum()
    }

    /// Drop expired ad grants, returning how many were removed
    pub fn prune_expired_grants(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.grants.len();
        self.grants.retain(|g| g.is_active(now));
        before - self.grants.len()
    }

    /// Fold a legacy `cards` surplus into an addon grant so that all
    /// allowance math runs over `grants`.
    ///
    /// Returns `true` if the record changed.
    pub fn migrate_legacy_cards(&mut self) -> bool {
        let from_grants = self.cards();
        if self.cards > from_grants {
            self.grants.push(Grant::PurchasedAddon {
                amount: self.cards - from_grants,
                purchased_at: None,
            });
            return true;
        }
        if self.cards != from_grants {
            self.cards = from_grants;
            return true;
        }
        false
    }

    /// Whether a temporary override is in force at `now`
    pub fn temporary_override_active(&self, now: DateTime<Utc>) -> bool {
        self.temporary_unlock_until.is_some_and(|until| until > now)
    }

    /// Current position in the override state machine
    pub fn override_state(&self, now: DateTime<Utc>) -> OverrideState {
        if self.permanent_unlock {
            OverrideState::PermanentOverride
        } else if self.temporary_override_active(now) {
            OverrideState::TemporaryOverride
        } else if self.active_ad_grants(now) > 0 {
            OverrideState::AdBonusActive
        } else {
            OverrideState::Normal
        }
    }
}

/// Override state of a record, derived lazily from its fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideState {
    Normal,
    AdBonusActive,
    TemporaryOverride,
    PermanentOverride,
}

impl std::fmt::Display for OverrideState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverrideState::Normal => write!(f, "normal"),
            OverrideState::AdBonusActive => write!(f, "ad_bonus_active"),
            OverrideState::TemporaryOverride => write!(f, "temporary_override"),
            OverrideState::PermanentOverride => write!(f, "permanent_override"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
