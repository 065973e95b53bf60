//! Limit services
//!
//! [`LimitServiceFactory`] turns a [`LimitDefinition`] into a [`LimitService`]:
//! one concrete quota service per action type, wired to the shared store,
//! resolver, guest policy and clock, with its own read-through cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cache::{CacheKey, CacheStats, ReadThroughCache};
use super::config::{
    Clock, ConfigResolver, DesignatedGuests, GuestIdentity, LimitConfig, LimitDefinition, SystemClock,
};
use super::document::{load_or_default, FieldPath, LimitsDocument, LoadedRecord};
use super::reset::check_and_reset_all;
use super::store::{run_transaction, Commit, DocumentStore};
use super::tracker::{
    self, AdUnlockOutcome, CardPurchaseOutcome, CheckReason, CheckResult, RollbackOutcome,
    RollbackRequest, TemporaryUnlockOutcome,
};
use super::types::{Allowance, EntitlementRecord, OverrideState, UsageMetadata};
use crate::error::{Error, Result};
use crate::settings::EngineSettings;

// ============================================================================
// Responses
// ============================================================================

/// Successful mutation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack<T> {
    pub success: bool,
    #[serde(flatten)]
    pub result: T,
}

impl<T> Ack<T> {
    fn ok(result: T) -> Self {
        Self { success: true, result }
    }
}

/// Answer to "may this user act right now?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanUseResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CheckReason>,
    pub used: u32,
    pub total: Allowance,
    pub remaining: Allowance,
    pub tier: String,
    pub limit: Allowance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_until: Option<DateTime<Utc>>,
}

impl CanUseResponse {
    fn guest() -> Self {
        Self {
            allowed: false,
            reason: Some(CheckReason::GuestNotAllowed),
            used: 0,
            total: Allowance::Limited(0),
            remaining: Allowance::Limited(0),
            tier: "guest".to_string(),
            limit: Allowance::Limited(0),
            remaining_days: None,
            unlock_until: None,
        }
    }

    fn from_check(check: CheckResult, config: &LimitConfig) -> Self {
        Self {
            allowed: check.allowed,
            reason: check.reason,
            used: check.used,
            total: check.total,
            remaining: check.remaining,
            tier: config.tier.clone(),
            limit: config.limit,
            remaining_days: check.remaining_days,
            unlock_until: check.unlock_until,
        }
    }
}

/// Result of a counted use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUseResponse {
    pub success: bool,
    pub count: u32,
    pub limit: Allowance,
    pub total_allowed: Allowance,
    /// Remaining before this use was counted
    pub remaining: Allowance,
    /// Identifies this use; pass it as the rollback idempotency key
    pub event_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermanentUnlockOutcome {
    pub previous: bool,
    pub permanent_unlock: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCountOutcome {
    pub previous_count: u32,
    pub new_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOutcome {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearOutcome {
    /// Documents that held this limit type
    pub cleared_count: usize,
}

/// Full snapshot of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStats {
    pub tier: String,
    pub unlimited: bool,
    pub limit: Allowance,
    pub standard_limit: Allowance,
    pub is_test_account: bool,
    pub used: u32,
    pub remaining: Allowance,
    pub total: Allowance,
    pub override_state: OverrideState,
    pub permanent_unlock: bool,
    pub temporary_unlock_until: Option<DateTime<Utc>>,
    /// Unexpired ad grant total
    pub active_ad_grants: u32,
    /// Legacy cumulative ad-grant total
    pub unlocked: u32,
    pub cards: u32,
    pub ads_watched_today: u32,
    pub lifetime_used: u32,
    pub last_reset_date: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-character line in [`CharacterStats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterUsage {
    pub used: u32,
    pub total: Allowance,
    pub remaining: Allowance,
    pub lifetime_used: u32,
    pub override_state: OverrideState,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Every character a user has a record for, under a per-character limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterStats {
    pub tier: String,
    pub unlimited: bool,
    pub limit_per_character: Allowance,
    pub standard_limit_per_character: Allowance,
    pub is_test_account: bool,
    pub characters: BTreeMap<String, CharacterUsage>,
}

/// One record inside a [`UserLimitSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    pub count: u32,
    pub lifetime_count: u32,
    pub override_state: OverrideState,
}

/// This limit type's records for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLimitSummary {
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
    pub records: Vec<RecordSummary>,
}

// ============================================================================
// Factory
// ============================================================================

/// Shared wiring for every limit service
#[derive(Clone)]
pub struct LimitServiceFactory {
    store: Arc<dyn DocumentStore>,
    resolver: Arc<dyn ConfigResolver>,
    guests: Arc<dyn GuestIdentity>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl LimitServiceFactory {
    /// Factory with the default guest set, wall clock and settings
    pub fn new(store: Arc<dyn DocumentStore>, resolver: Arc<dyn ConfigResolver>) -> Self {
        Self {
            store,
            resolver,
            guests: Arc::new(DesignatedGuests::default()),
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_guests(mut self, guests: Arc<dyn GuestIdentity>) -> Self {
        self.guests = guests;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings.validate();
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Build a service; an invalid definition fails here, never at call time
    pub fn create(&self, definition: LimitDefinition) -> Result<LimitService> {
        let field = definition.validate()?.to_string();
        log::debug!(
            "[limits:service] Created {} on field '{}' (reset: {}, per character: {})",
            definition.service_name,
            field,
            definition.reset_period,
            definition.per_character
        );

        Ok(LimitService {
            field,
            definition,
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            guests: Arc::clone(&self.guests),
            clock: Arc::clone(&self.clock),
            cache: ReadThroughCache::new(self.settings.cache_capacity, self.settings.cache_ttl()),
            max_attempts: self.settings.max_transaction_attempts,
        })
    }
}

// ============================================================================
// Service
// ============================================================================

/// Quota service for one action type
pub struct LimitService {
    definition: LimitDefinition,
    field: String,
    store: Arc<dyn DocumentStore>,
    resolver: Arc<dyn ConfigResolver>,
    guests: Arc<dyn GuestIdentity>,
    clock: Arc<dyn Clock>,
    cache: ReadThroughCache,
    max_attempts: u32,
}

impl LimitService {
    pub fn definition(&self) -> &LimitDefinition {
        &self.definition
    }

    pub fn field_name(&self) -> &str {
        &self.field
    }

    /// Check whether one more use is allowed. Never writes on behalf of the
    /// check itself; only first-use initialisation or a due rollover is
    /// persisted.
    pub async fn can_use(&self, user_id: &str, character_id: Option<&str>) -> Result<CanUseResponse> {
        if self.rejects_guest(user_id) {
            log::warn!(
                "[limits:service] Guest {} denied {}",
                user_id,
                self.definition.limit_type
            );
            return Ok(CanUseResponse::guest());
        }

        let path = self.path(character_id)?;
        let config = self.resolver.resolve(user_id, &self.definition).await?;
        let mut record = self.read_record(user_id, &path).await?;

        let now = self.clock.now();
        check_and_reset_all(&mut record, self.definition.reset_period, now);
        let check = tracker::check_can_use(&mut record, config.limit, false, now);

        Ok(CanUseResponse::from_check(check, &config))
    }

    /// Atomically re-check and consume one use
    pub async fn record_use(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        metadata: Option<UsageMetadata>,
    ) -> Result<RecordUseResponse> {
        if self.rejects_guest(user_id) {
            log::warn!(
                "[limits:service] Guest {} cannot record {}",
                user_id,
                self.definition.limit_type
            );
            return Err(Error::GuestNotAllowed(self.definition.limit_type.clone()));
        }

        let path = self.path(character_id)?;
        let config = self.resolver.resolve(user_id, &self.definition).await?;
        let limit_type = self.definition.limit_type.clone();

        let outcome = self
            .mutate(user_id, &path, |record, now| {
                tracker::record_use(record, config.limit, &limit_type, metadata.clone(), now)
            })
            .await?;

        Ok(RecordUseResponse {
            success: true,
            count: outcome.count,
            limit: config.limit,
            total_allowed: outcome.total_allowed,
            remaining: outcome.remaining,
            event_id: outcome.event_id,
        })
    }

    /// Give back one use; repeated keys are no-ops
    pub async fn decrement_use(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        request: RollbackRequest,
    ) -> Result<Ack<RollbackOutcome>> {
        let path = self.path(character_id)?;
        let outcome = self
            .mutate(user_id, &path, |record, now| Ok(tracker::decrement_use(record, &request, now)))
            .await?;

        if outcome.idempotent {
            log::debug!(
                "[limits:service] Rollback {} for {} already applied",
                request.idempotency_key.as_deref().unwrap_or_default(),
                path
            );
        }
        Ok(Ack::ok(outcome))
    }

    /// Grant `amount` extra uses for 24 hours
    pub async fn unlock_by_ad(
        &self,
        user_id: &str,
        amount: u32,
        character_id: Option<&str>,
    ) -> Result<Ack<AdUnlockOutcome>> {
        if amount == 0 {
            return Err(Error::validation("ad unlock amount must be positive"));
        }
        let path = self.path(character_id)?;
        let policy = self.definition.ad_policy;

        let outcome = self
            .mutate(user_id, &path, |record, now| {
                if let Some(policy) = policy {
                    if record.ads_watched_today >= policy.daily_limit {
                        return Err(Error::AdLimitReached(policy.daily_limit));
                    }
                    if let Some(last) = record.last_ad_time {
                        let elapsed = (now - last).num_seconds();
                        if elapsed < policy.cooldown_secs {
                            return Err(Error::AdCooldown(policy.cooldown_secs - elapsed));
                        }
                    }
                }
                Ok(tracker::unlock_by_ad(record, amount, now))
            })
            .await?;

        Ok(Ack::ok(outcome))
    }

    /// Add permanent addon uses.
    ///
    /// **Deprecated**: permanent addons belong in the asset ledger.
    pub async fn purchase_cards(
        &self,
        user_id: &str,
        amount: u32,
        character_id: Option<&str>,
    ) -> Result<Ack<CardPurchaseOutcome>> {
        if amount == 0 {
            return Err(Error::validation("card amount must be positive"));
        }
        let path = self.path(character_id)?;
        let outcome = self
            .mutate(user_id, &path, |record, now| Ok(tracker::purchase_cards(record, amount, now)))
            .await?;
        Ok(Ack::ok(outcome))
    }

    /// Time-boxed full override, `days` defaulting to 7
    pub async fn unlock_permanently(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        days: Option<u32>,
    ) -> Result<Ack<TemporaryUnlockOutcome>> {
        if days == Some(0) {
            return Err(Error::validation("unlock days must be positive"));
        }
        let path = self.path(character_id)?;
        let outcome = self
            .mutate(user_id, &path, |record, now| Ok(tracker::unlock_permanently(record, days, now)))
            .await?;
        Ok(Ack::ok(outcome))
    }

    /// Admin: set or clear the non-expiring override
    pub async fn set_permanent_unlock(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        enabled: bool,
    ) -> Result<Ack<PermanentUnlockOutcome>> {
        let path = self.path(character_id)?;
        let previous = self
            .mutate(user_id, &path, |record, now| Ok(tracker::set_permanent_unlock(record, enabled, now)))
            .await?;

        log::info!(
            "[limits:service] Permanent unlock for {} on {}: {} -> {}",
            user_id,
            path,
            previous,
            enabled
        );
        Ok(Ack::ok(PermanentUnlockOutcome {
            previous,
            permanent_unlock: enabled,
        }))
    }

    /// Admin: overwrite the current period count
    pub async fn set_count(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        count: u32,
    ) -> Result<Ack<SetCountOutcome>> {
        let path = self.path(character_id)?;
        let previous = self
            .mutate(user_id, &path, |record, now| Ok(tracker::set_count(record, count, now)))
            .await?;

        log::info!(
            "[limits:service] Count for {} on {} set {} -> {}",
            user_id,
            path,
            previous,
            count
        );
        Ok(Ack::ok(SetCountOutcome {
            previous_count: previous,
            new_count: count,
        }))
    }

    /// Full snapshot of one record
    pub async fn get_stats(&self, user_id: &str, character_id: Option<&str>) -> Result<LimitStats> {
        let path = self.path(character_id)?;
        let config = self.resolver.resolve(user_id, &self.definition).await?;
        let mut record = self.read_record(user_id, &path).await?;

        let now = self.clock.now();
        check_and_reset_all(&mut record, self.definition.reset_period, now);
        let check = tracker::check_can_use(&mut record, config.limit, false, now);

        Ok(LimitStats {
            tier: config.tier,
            unlimited: config.limit.is_unlimited(),
            limit: config.limit,
            standard_limit: config.standard_limit,
            is_test_account: config.is_test_account,
            used: check.used,
            remaining: check.remaining,
            total: check.total,
            override_state: record.override_state(now),
            permanent_unlock: record.permanent_unlock,
            temporary_unlock_until: record.temporary_unlock_until,
            active_ad_grants: record.active_ad_grants(now),
            unlocked: record.legacy_unlocked(),
            cards: record.cards(),
            ads_watched_today: record.ads_watched_today,
            lifetime_used: record.lifetime_count,
            last_reset_date: record.last_reset_date.clone(),
            last_used_at: record.last_used_at,
        })
    }

    /// Per-character breakdown for one user
    pub async fn get_character_stats(&self, user_id: &str) -> Result<CharacterStats> {
        if !self.definition.per_character {
            return Err(Error::validation(format!(
                "{} is not tracked per character",
                self.definition.limit_type
            )));
        }

        let config = self.resolver.resolve(user_id, &self.definition).await?;
        let doc = self.store.get(user_id).await?;
        let now = self.clock.now();

        let mut characters = BTreeMap::new();
        for (character_id, record) in self.character_records(doc.as_ref(), now) {
            let mut record = record;
            let check = tracker::check_can_use(&mut record, config.limit, false, now);
            characters.insert(
                character_id,
                CharacterUsage {
                    used: check.used,
                    total: check.total,
                    remaining: check.remaining,
                    lifetime_used: record.lifetime_count,
                    override_state: record.override_state(now),
                    last_used_at: record.last_used_at,
                },
            );
        }

        Ok(CharacterStats {
            tier: config.tier,
            unlimited: config.limit.is_unlimited(),
            limit_per_character: config.limit,
            standard_limit_per_character: config.standard_limit,
            is_test_account: config.is_test_account,
            characters,
        })
    }

    /// Summaries of this limit type for every user that has a record
    pub async fn get_all_stats(&self) -> Result<Vec<UserLimitSummary>> {
        let docs = self.store.list().await?;
        let now = self.clock.now();

        let mut summaries = Vec::new();
        for doc in &docs {
            if !doc.fields.contains_key(&self.field) {
                continue;
            }

            let records: Vec<RecordSummary> = if self.definition.per_character {
                self.character_records(Some(doc), now)
                    .into_iter()
                    .map(|(id, record)| summarize(Some(id), &record, now))
                    .collect()
            } else {
                let path = FieldPath::Flat(self.field.clone());
                let loaded = load_or_default(Some(doc), &path, self.definition.reset_period, now)?;
                vec![summarize(None, &loaded.record, now)]
            };

            summaries.push(UserLimitSummary {
                user_id: doc.user_id.clone(),
                updated_at: doc.updated_at,
                records,
            });
        }

        log::debug!(
            "[limits:service] {} users hold {} records",
            summaries.len(),
            self.field
        );
        Ok(summaries)
    }

    /// Admin: restore a record to its initial state, clearing overrides.
    ///
    /// For per-character services, omitting the character resets every
    /// character of the user.
    pub async fn reset(&self, user_id: &str, character_id: Option<&str>) -> Result<Ack<ResetOutcome>> {
        let whole_field = self.definition.per_character && character_id.is_none();
        let path = if whole_field {
            None
        } else {
            Some(self.path(character_id)?)
        };
        let period = self.definition.reset_period;

        run_transaction(
            self.store.as_ref(),
            self.clock.as_ref(),
            user_id,
            self.max_attempts,
            |doc| {
                match &path {
                    Some(path) => {
                        let fresh = load_or_default(None, path, period, self.clock.now())?;
                        doc.put(path, &fresh.record)?;
                    }
                    None => {
                        doc.remove_field(&self.field);
                    }
                }
                Ok(Commit::Write(()))
            },
        )
        .await?;

        match &path {
            Some(path) => self.cache.invalidate(&self.cache_key(user_id, path)),
            None => self.cache.invalidate_user(user_id),
        }

        log::info!(
            "[limits:service] Reset {} for {}{}",
            self.field,
            user_id,
            character_id.map(|c| format!(" (character {})", c)).unwrap_or_default()
        );
        Ok(Ack::ok(ResetOutcome {
            field: self.field.clone(),
            character_id: character_id.map(str::to_string),
            message: format!("{} limit reset", self.definition.limit_type),
        }))
    }

    /// Admin: remove this limit type from every user document
    pub async fn clear_all(&self) -> Result<Ack<ClearOutcome>> {
        let docs = self.store.list().await?;
        let mut cleared = 0;

        for doc in docs.iter().filter(|d| d.fields.contains_key(&self.field)) {
            let removed = run_transaction(
                self.store.as_ref(),
                self.clock.as_ref(),
                &doc.user_id,
                self.max_attempts,
                |doc| {
                    if doc.remove_field(&self.field) {
                        Ok(Commit::Write(true))
                    } else {
                        Ok(Commit::Skip(false))
                    }
                },
            )
            .await?;
            if removed {
                cleared += 1;
            }
        }

        self.cache.clear();
        log::info!(
            "[limits:service] Cleared {} from {} documents",
            self.field,
            cleared
        );
        Ok(Ack::ok(ClearOutcome { cleared_count: cleared }))
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached record of this service
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn rejects_guest(&self, user_id: &str) -> bool {
        !self.definition.allow_guest && self.guests.is_guest(user_id)
    }

    fn path(&self, character_id: Option<&str>) -> Result<FieldPath> {
        if !self.definition.per_character {
            return Ok(FieldPath::Flat(self.field.clone()));
        }

        match character_id.map(str::trim) {
            Some(id) if !id.is_empty() && id != "null" && id != "undefined" => Ok(FieldPath::PerCharacter {
                field: self.field.clone(),
                character_id: id.to_string(),
            }),
            _ => Err(Error::validation(format!(
                "{} requires a valid character id",
                self.definition.limit_type
            ))),
        }
    }

    fn cache_key(&self, user_id: &str, path: &FieldPath) -> CacheKey {
        CacheKey::new(path.field(), user_id, path.character_id())
    }

    /// Cached copy of the record, or a transactional load that persists
    /// first-use initialisation and due rollovers
    async fn read_record(&self, user_id: &str, path: &FieldPath) -> Result<EntitlementRecord> {
        let key = self.cache_key(user_id, path);
        if let Some(record) = self.cache.get(&key) {
            return Ok(record);
        }
        let generation = self.cache.generation();

        let period = self.definition.reset_period;
        let record = run_transaction(
            self.store.as_ref(),
            self.clock.as_ref(),
            user_id,
            self.max_attempts,
            |doc| {
                let LoadedRecord { record, dirty } = load_or_default(Some(&*doc), path, period, self.clock.now())?;
                if dirty {
                    doc.put(path, &record)?;
                    Ok(Commit::Write(record))
                } else {
                    Ok(Commit::Skip(record))
                }
            },
        )
        .await?;

        log::debug!("[limits:service] Loaded {} for {} from store", path, user_id);
        if !self.cache.insert_if_current(key, record.clone(), generation) {
            log::debug!("[limits:cache] Skipped fill of {} for {} after a concurrent write", path, user_id);
        }
        Ok(record)
    }

    /// Load, mutate and write back one record in a single transaction, then
    /// invalidate its cache entry. An `Err` from `f` aborts with no write.
    async fn mutate<T, F>(&self, user_id: &str, path: &FieldPath, mut f: F) -> Result<T>
    where
        F: FnMut(&mut EntitlementRecord, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        let period = self.definition.reset_period;
        let value = run_transaction(
            self.store.as_ref(),
            self.clock.as_ref(),
            user_id,
            self.max_attempts,
            |doc| {
                let now = self.clock.now();
                let LoadedRecord { mut record, dirty } = load_or_default(Some(&*doc), path, period, now)?;
                let before = record.clone();
                let value = f(&mut record, now)?;

                if !dirty && record == before {
                    return Ok(Commit::Skip(value));
                }
                doc.put(path, &record)?;
                Ok(Commit::Write(value))
            },
        )
        .await?;

        self.cache.invalidate(&self.cache_key(user_id, path));
        Ok(value)
    }

    /// Decoded, migrated and rolled-over records of every character
    fn character_records(&self, doc: Option<&LimitsDocument>, now: DateTime<Utc>) -> Vec<(String, EntitlementRecord)> {
        let Some(doc) = doc else {
            return Vec::new();
        };
        doc.character_records(&self.field)
            .into_iter()
            .map(|(id, mut record)| {
                record.migrate_legacy_cards();
                check_and_reset_all(&mut record, self.definition.reset_period, now);
                (id, record)
            })
            .collect()
    }
}

fn summarize(character_id: Option<String>, record: &EntitlementRecord, now: DateTime<Utc>) -> RecordSummary {
    RecordSummary {
        character_id,
        count: record.count,
        lifetime_count: record.lifetime_count,
        override_state: record.override_state(now),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::limits::config::{AdPolicy, ManualClock, StaticConfigResolver};
    use crate::services::limits::memory::MemoryDocumentStore;
    use crate::services::limits::store::DocumentTransaction;
    use crate::services::limits::types::ResetPeriod;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn three(_tier: &str) -> Allowance {
        Allowance::Limited(3)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
    }

    fn factory(clock: &ManualClock) -> (LimitServiceFactory, Arc<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let factory = LimitServiceFactory::new(store.clone(), Arc::new(StaticConfigResolver::default()))
            .with_clock(Arc::new(clock.clone()));
        (factory, store)
    }

    fn photos() -> LimitDefinition {
        LimitDefinition::new("photo limit", "photos", three)
            .with_field_name("photos")
            .with_reset_period(ResetPeriod::None)
    }

    fn voice() -> LimitDefinition {
        LimitDefinition::new("voice limit", "voice", three)
            .with_field_name("voice")
            .with_reset_period(ResetPeriod::Daily)
            .per_character()
    }

    #[test]
    fn test_create_rejects_missing_field_name() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let result = factory.create(LimitDefinition::new("broken", "broken", three));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_guest_short_circuits() {
        let clock = ManualClock::new(t0());
        let (factory, store) = factory(&clock);
        let service = factory.create(photos()).unwrap();

        let check = service.can_use("guest", None).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(CheckReason::GuestNotAllowed));
        assert_eq!(check.tier, "guest");

        let err = service.record_use("guest", None, None).await.unwrap_err();
        assert!(matches!(err, Error::GuestNotAllowed(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guest_allowed_when_definition_permits() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(photos().allow_guest()).unwrap();
        assert!(service.can_use("guest", None).await.unwrap().allowed);
        assert!(service.record_use("guest", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_character_requires_id() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(voice()).unwrap();

        for bad in [None, Some(""), Some("null"), Some("undefined")] {
            let err = service.can_use("u1", bad).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?}", bad);
        }
        assert!(service.can_use("u1", Some("char-a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_record_use_invalidates_cache() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(photos()).unwrap();

        assert_eq!(service.can_use("u1", None).await.unwrap().used, 0);
        assert_eq!(service.can_use("u1", None).await.unwrap().used, 0);
        assert_eq!(service.get_cache_stats().hits, 1);

        service.record_use("u1", None, None).await.unwrap();
        let check = service.can_use("u1", None).await.unwrap();
        assert_eq!(check.used, 1);
        assert_eq!(check.remaining, Allowance::Limited(2));
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_count() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(photos()).unwrap();

        for _ in 0..3 {
            service.record_use("u1", None, None).await.unwrap();
        }
        let err = service.record_use("u1", None, None).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { used: 3, total: 3, .. }));
        assert_eq!(service.get_stats("u1", None).await.unwrap().used, 3);
    }

    #[tokio::test]
    async fn test_ad_policy_cooldown_and_cap() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let policy = AdPolicy {
            daily_limit: 2,
            cooldown_secs: 60,
        };
        let service = factory.create(photos().with_ad_policy(policy)).unwrap();

        service.unlock_by_ad("u1", 1, None).await.unwrap();
        let err = service.unlock_by_ad("u1", 1, None).await.unwrap_err();
        assert!(matches!(err, Error::AdCooldown(60)));

        clock.advance(Duration::seconds(61));
        service.unlock_by_ad("u1", 1, None).await.unwrap();

        clock.advance(Duration::seconds(61));
        let err = service.unlock_by_ad("u1", 1, None).await.unwrap_err();
        assert!(matches!(err, Error::AdLimitReached(2)));

        // next UTC day the counter starts over
        clock.advance(Duration::days(1));
        let ack = service.unlock_by_ad("u1", 1, None).await.unwrap();
        assert_eq!(ack.result.ads_watched_today, 1);
    }

    #[tokio::test]
    async fn test_permanent_unlock_state_and_reset() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(photos()).unwrap();

        service.set_count("u1", None, 3).await.unwrap();
        assert!(!service.can_use("u1", None).await.unwrap().allowed);

        let ack = service.set_permanent_unlock("u1", None, true).await.unwrap();
        assert!(!ack.result.previous);
        let stats = service.get_stats("u1", None).await.unwrap();
        assert_eq!(stats.override_state, OverrideState::PermanentOverride);
        assert!(service.can_use("u1", None).await.unwrap().allowed);

        service.reset("u1", None).await.unwrap();
        let stats = service.get_stats("u1", None).await.unwrap();
        assert_eq!(stats.override_state, OverrideState::Normal);
        assert_eq!(stats.used, 0);
    }

    #[tokio::test]
    async fn test_reset_without_character_clears_every_character() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(voice()).unwrap();

        service.record_use("u1", Some("a"), None).await.unwrap();
        service.record_use("u1", Some("b"), None).await.unwrap();
        assert_eq!(service.get_character_stats("u1").await.unwrap().characters.len(), 2);

        service.reset("u1", None).await.unwrap();
        assert!(service.get_character_stats("u1").await.unwrap().characters.is_empty());
        assert_eq!(service.can_use("u1", Some("a")).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_daily_rollover_through_service() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(voice()).unwrap();

        for _ in 0..3 {
            service.record_use("u1", Some("a"), None).await.unwrap();
        }
        assert!(!service.can_use("u1", Some("a")).await.unwrap().allowed);

        clock.advance(Duration::days(1));
        // cached copy from yesterday still rolls over on read
        let check = service.can_use("u1", Some("a")).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.used, 0);

        let stats = service.get_stats("u1", Some("a")).await.unwrap();
        assert_eq!(stats.lifetime_used, 3);
    }

    #[tokio::test]
    async fn test_clear_all_is_field_scoped() {
        let clock = ManualClock::new(t0());
        let (factory, store) = factory(&clock);
        let photos = factory.create(photos()).unwrap();
        let voice = factory.create(voice()).unwrap();

        photos.record_use("u1", None, None).await.unwrap();
        photos.record_use("u2", None, None).await.unwrap();
        voice.record_use("u1", Some("a"), None).await.unwrap();

        let ack = photos.clear_all().await.unwrap();
        assert_eq!(ack.result.cleared_count, 2);
        assert!(photos.get_all_stats().await.unwrap().is_empty());

        let doc = store.get("u1").await.unwrap().unwrap();
        assert!(doc.fields.contains_key("voice"));
        assert_eq!(voice.get_all_stats().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(photos()).unwrap();
        service.set_count("u1", None, 2).await.unwrap();

        let request = RollbackRequest::with_key("order-1");
        let first = service.decrement_use("u1", None, request.clone()).await.unwrap();
        let second = service.decrement_use("u1", None, request).await.unwrap();
        assert_eq!(first.result.new_count, 1);
        assert!(second.result.idempotent);
        assert_eq!(service.get_stats("u1", None).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_zero_amounts_rejected() {
        let clock = ManualClock::new(t0());
        let (factory, _) = factory(&clock);
        let service = factory.create(photos()).unwrap();
        assert!(matches!(service.unlock_by_ad("u1", 0, None).await, Err(Error::Validation(_))));
        assert!(matches!(service.purchase_cards("u1", 0, None).await, Err(Error::Validation(_))));
        assert!(matches!(
            service.unlock_permanently("u1", None, Some(0)).await,
            Err(Error::Validation(_))
        ));
    }

    /// Memory store that can hold one `begin` open after its snapshot is read
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryDocumentStore,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl DocumentStore for GatedStore {
        async fn get(&self, user_id: &str) -> Result<Option<LimitsDocument>> {
            self.inner.get(user_id).await
        }

        async fn begin(&self, user_id: &str) -> Result<Box<dyn DocumentTransaction>> {
            let tx = self.inner.begin(user_id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            Ok(tx)
        }

        async fn list(&self) -> Result<Vec<LimitsDocument>> {
            self.inner.list().await
        }

        async fn delete(&self, user_id: &str) -> Result<bool> {
            self.inner.delete(user_id).await
        }
    }

    #[tokio::test]
    async fn test_read_racing_a_write_does_not_cache_stale_record() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(GatedStore::default());
        let factory = LimitServiceFactory::new(store.clone(), Arc::new(StaticConfigResolver::default()))
            .with_clock(Arc::new(clock.clone()));
        let service = Arc::new(factory.create(photos()).unwrap());
        service.record_use("u1", None, None).await.unwrap();
        service.record_use("u1", None, None).await.unwrap();

        // the check reads count=2, then stalls before filling the cache
        store.armed.store(true, Ordering::SeqCst);
        let reader = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.can_use("u1", None).await })
        };
        store.reached.notified().await;

        let third = service.record_use("u1", None, None).await.unwrap();
        assert_eq!(third.count, 3);
        store.release.notify_one();

        let in_flight = reader.await.unwrap().unwrap();
        assert_eq!(in_flight.used, 2);

        for _ in 0..3 {
            let check = service.can_use("u1", None).await.unwrap();
            assert!(!check.allowed);
            assert_eq!(check.used, 3);
        }
    }
}
