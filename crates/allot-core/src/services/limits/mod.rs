//! Usage limits module
//!
//! Answers "may this user perform this limited action right now?" and
//! "record that they just did" for any number of limit types, each with its
//! own reset cadence, bonus grants and override modes, and stays correct
//! under concurrent requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ LimitServiceFactory::create(LimitDefinition)            │
//! │   -> LimitService (one per action type)                 │
//! │        - can_use() / record_use() / decrement_use()     │
//! │        - unlock_by_ad() / unlock_permanently()          │
//! │        - get_stats() / reset() / clear_all()            │
//! └─────────────────────────────────────────────────────────┘
//!          │ reads                      │ writes
//!          ▼                            ▼
//! ┌──────────────────┐      ┌──────────────────────────────┐
//! │ ReadThroughCache │      │ run_transaction()            │
//! │ (moka, TTL, LRU) │◄─────│   load_or_default()          │
//! └──────────────────┘ inv. │   reset::check_and_reset_all │
//!                           │   tracker::*                 │
//!                           └──────────────────────────────┘
//!                                       │ compare-and-swap
//!                                       ▼
//!                           ┌──────────────────────────────┐
//!                           │ trait DocumentStore          │
//!                           │   SqliteDocumentStore        │
//!                           │   MemoryDocumentStore        │
//!                           └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use allot_core::services::limits::{LimitKind, LimitServiceFactory, SqliteDocumentStore, StaticConfigResolver};
//!
//! let store = Arc::new(SqliteDocumentStore::connect("sqlite:allot.db").await?);
//! let factory = LimitServiceFactory::new(store, Arc::new(StaticConfigResolver::default()));
//! let photos = factory.create(LimitKind::Photos.definition())?;
//!
//! if photos.can_use("u1", None).await?.allowed {
//!     photos.record_use("u1", None, None).await?;
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod document;
pub mod memory;
pub mod reset;
pub mod service;
pub mod store;
pub mod tracker;
pub mod types;

pub use cache::{CacheKey, CacheStats, Generation, ReadThroughCache};
pub use catalog::LimitKind;
pub use config::{
    AdPolicy, Clock, ConfigResolver, DesignatedGuests, GuestIdentity, LimitConfig, LimitDefinition,
    ManualClock, MembershipLimitFn, StaticConfigResolver, SystemClock,
};
pub use document::{load_or_default, FieldPath, LimitsDocument, LoadedRecord};
pub use memory::MemoryDocumentStore;
pub use reset::{check_and_reset, check_and_reset_ad_counter, check_and_reset_all, period_key};
pub use service::{
    Ack, CanUseResponse, CharacterStats, CharacterUsage, ClearOutcome, LimitService,
    LimitServiceFactory, LimitStats, PermanentUnlockOutcome, RecordSummary, RecordUseResponse,
    ResetOutcome, SetCountOutcome, UserLimitSummary,
};
pub use store::{run_transaction, Commit, DocumentStore, DocumentTransaction, SqliteDocumentStore};
pub use tracker::{
    AdUnlockOutcome, CardPurchaseOutcome, CheckReason, CheckResult, RollbackOutcome, RollbackRequest,
    TemporaryUnlockOutcome, UseOutcome,
};
pub use types::{
    Allowance, EntitlementRecord, Grant, HistoryAction, HistoryEntry, OverrideState, ResetPeriod,
    UsageEvent, UsageMetadata,
};
