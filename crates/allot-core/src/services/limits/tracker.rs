//! Usage tracking
//!
//! Pure decision and mutation logic over a single [`EntitlementRecord`].
//! Nothing here touches storage; callers run these functions inside a
//! persistence transaction and write the record back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{
    push_capped, Allowance, EntitlementRecord, Grant, HistoryAction, HistoryEntry, UsageEvent,
    UsageMetadata, DEFAULT_UNLOCK_DAYS,
};
use crate::error::{Error, Result};

// ============================================================================
// Result Types
// ============================================================================

/// Why a check came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckReason {
    Unlimited,
    PermanentUnlock,
    TemporaryUnlock,
    LimitExceeded,
    GuestNotAllowed,
}

/// Outcome of [`check_can_use`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub allowed: bool,
    pub used: u32,
    pub total: Allowance,
    pub remaining: Allowance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CheckReason>,
    /// Whole days left on a temporary override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_until: Option<DateTime<Utc>>,
}

impl CheckResult {
    fn unlimited(used: u32, reason: CheckReason) -> Self {
        Self {
            allowed: true,
            used,
            total: Allowance::Unlimited,
            remaining: Allowance::Unlimited,
            reason: Some(reason),
            remaining_days: None,
            unlock_until: None,
        }
    }
}

/// Outcome of [`record_use`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseOutcome {
    pub count: u32,
    pub total_allowed: Allowance,
    /// Remaining before this use was counted
    pub remaining: Allowance,
    pub event_id: Uuid,
}

/// Outcome of [`decrement_use`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub idempotent: bool,
    pub previous_count: u32,
    pub new_count: u32,
    pub decremented: u32,
}

/// Outcome of [`unlock_by_ad`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdUnlockOutcome {
    pub unlocked_amount: u32,
    /// Legacy cumulative display total
    pub total_unlocked: u32,
    pub ads_watched_today: u32,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`purchase_cards`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPurchaseOutcome {
    pub purchased: u32,
    pub total_cards: u32,
}

/// Outcome of [`unlock_permanently`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryUnlockOutcome {
    pub temporary_unlock: bool,
    pub days: u32,
    pub unlock_until: DateTime<Utc>,
}

/// Rollback context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    /// Repeated rollbacks with the same key are no-ops
    pub idempotency_key: Option<String>,
    pub reason: Option<String>,
}

impl RollbackRequest {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            reason: None,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Decide whether one more use is allowed.
///
/// Order of precedence: unlimited tier, permanent override, temporary
/// override, then counting. An expired temporary override is cleared on the
/// record as a side effect. With `prune_expired` set (only inside a write
/// transaction) expired ad grants are dropped before summing.
pub fn check_can_use(
    record: &mut EntitlementRecord,
    base_limit: Allowance,
    prune_expired: bool,
    now: DateTime<Utc>,
) -> CheckResult {
    let base = match base_limit {
        Allowance::Unlimited => return CheckResult::unlimited(record.count, CheckReason::Unlimited),
        Allowance::Limited(n) => n,
    };

    if record.permanent_unlock {
        return CheckResult::unlimited(record.count, CheckReason::PermanentUnlock);
    }

    if let Some(until) = record.temporary_unlock_until {
        if until > now {
            let mut result = CheckResult::unlimited(record.count, CheckReason::TemporaryUnlock);
            // round up partial days
            let secs = (until - now).num_seconds();
            result.remaining_days = Some((secs + 86_399) / 86_400);
            result.unlock_until = Some(until);
            return result;
        }
        record.temporary_unlock_until = None;
    }

    if prune_expired {
        record.prune_expired_grants(now);
    }

    let valid_ad_grants = record.active_ad_grants(now);
    let total = base
        .saturating_add(valid_ad_grants)
        .saturating_add(record.cards());
    let remaining = total.saturating_sub(record.count);
    let allowed = remaining > 0;

    CheckResult {
        allowed,
        used: record.count,
        total: Allowance::Limited(total),
        remaining: Allowance::Limited(remaining),
        reason: if allowed { None } else { Some(CheckReason::LimitExceeded) },
        remaining_days: None,
        unlock_until: None,
    }
}

/// Re-check and consume one use.
///
/// Fails with [`Error::QuotaExceeded`] when the re-check denies, leaving the
/// record as it was apart from expired-entry cleanup.
pub fn record_use(
    record: &mut EntitlementRecord,
    base_limit: Allowance,
    limit_type: &str,
    metadata: Option<UsageMetadata>,
    now: DateTime<Utc>,
) -> Result<UseOutcome> {
    let check = check_can_use(record, base_limit, true, now);
    if !check.allowed {
        return Err(Error::QuotaExceeded {
            limit_type: limit_type.to_string(),
            used: check.used,
            total: match check.total {
                Allowance::Limited(n) => n,
                Allowance::Unlimited => u32::MAX,
            },
        });
    }

    record.count = record.count.saturating_add(1);
    record.lifetime_count = record.lifetime_count.saturating_add(1);
    record.last_used_at = Some(now);
    let event_id = Uuid::new_v4();
    push_capped(
        &mut record.usage_history,
        UsageEvent {
            timestamp: now,
            event_id: Some(event_id),
            metadata: metadata.unwrap_or_default(),
        },
    );

    Ok(UseOutcome {
        count: record.count,
        total_allowed: check.total,
        remaining: check.remaining,
        event_id,
    })
}

/// Give back one use after a failed side effect. Never fails.
pub fn decrement_use(
    record: &mut EntitlementRecord,
    request: &RollbackRequest,
    now: DateTime<Utc>,
) -> RollbackOutcome {
    if let Some(key) = request.idempotency_key.as_deref() {
        let seen = record.history.iter().any(|entry| {
            entry.action == HistoryAction::Rollback && entry.idempotency_key.as_deref() == Some(key)
        });
        if seen {
            return RollbackOutcome {
                idempotent: true,
                previous_count: record.count,
                new_count: record.count,
                decremented: 0,
            };
        }
    }

    let previous = record.count;
    record.count = previous.saturating_sub(1);
    push_capped(
        &mut record.history,
        HistoryEntry::new(HistoryAction::Rollback, now)
            .with_counts(previous, record.count)
            .with_idempotency_key(request.idempotency_key.clone())
            .with_reason(request.reason.clone()),
    );

    RollbackOutcome {
        idempotent: false,
        previous_count: previous,
        new_count: record.count,
        decremented: previous - record.count,
    }
}

/// Append a 24-hour ad grant
pub fn unlock_by_ad(record: &mut EntitlementRecord, amount: u32, now: DateTime<Utc>) -> AdUnlockOutcome {
    let grant = Grant::ad(amount, now);
    let expires_at = match &grant {
        Grant::Ad { expires_at, .. } => *expires_at,
        Grant::PurchasedAddon { .. } => now,
    };
    record.grants.push(grant);
    record.unlocked = record.unlocked.saturating_add(amount);
    record.ads_watched_today = record.ads_watched_today.saturating_add(1);
    record.last_ad_time = Some(now);
    push_capped(
        &mut record.history,
        HistoryEntry::new(HistoryAction::AdUnlock, now).with_amount(amount),
    );

    AdUnlockOutcome {
        unlocked_amount: amount,
        total_unlocked: record.unlocked,
        ads_watched_today: record.ads_watched_today,
        expires_at,
    }
}

/// Add a permanent addon.
///
/// **Deprecated**: permanent addons belong in the asset ledger; this is kept
/// for older integrations.
pub fn purchase_cards(record: &mut EntitlementRecord, amount: u32, now: DateTime<Utc>) -> CardPurchaseOutcome {
    record.grants.push(Grant::PurchasedAddon {
        amount,
        purchased_at: Some(now),
    });
    record.cards = record.cards();
    push_capped(
        &mut record.history,
        HistoryEntry::new(HistoryAction::CardPurchase, now).with_amount(amount),
    );

    CardPurchaseOutcome {
        purchased: amount,
        total_cards: record.cards,
    }
}

/// Grant a full override for `days` (default 7).
///
/// Despite the name this is time-boxed; the non-expiring override is
/// [`set_permanent_unlock`].
pub fn unlock_permanently(
    record: &mut EntitlementRecord,
    days: Option<u32>,
    now: DateTime<Utc>,
) -> TemporaryUnlockOutcome {
    let days = days.unwrap_or(DEFAULT_UNLOCK_DAYS);
    let until = now + Duration::days(i64::from(days));
    record.temporary_unlock_until = Some(until);
    push_capped(
        &mut record.history,
        HistoryEntry::new(HistoryAction::TemporaryUnlock, now).with_amount(days),
    );

    TemporaryUnlockOutcome {
        temporary_unlock: true,
        days,
        unlock_until: until,
    }
}

/// Admin path: set or clear the non-expiring override
pub fn set_permanent_unlock(record: &mut EntitlementRecord, enabled: bool, now: DateTime<Utc>) -> bool {
    let previous = record.permanent_unlock;
    record.permanent_unlock = enabled;
    push_capped(
        &mut record.history,
        HistoryEntry::new(HistoryAction::PermanentUnlock, now)
            .with_reason(Some(if enabled { "enabled" } else { "disabled" }.to_string())),
    );
    previous
}

/// Admin path: overwrite the period count
pub fn set_count(record: &mut EntitlementRecord, count: u32, now: DateTime<Utc>) -> u32 {
    let previous = record.count;
    record.count = count;
    push_capped(
        &mut record.history,
        HistoryEntry::new(HistoryAction::CountAdjusted, now).with_counts(previous, count),
    );
    previous
}

// ============================================================================
// Tests
// ============================================================================
