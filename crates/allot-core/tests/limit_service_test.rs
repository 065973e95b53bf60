//! Integration tests for limit services over a real SQLite database

use std::sync::Arc;

use allot_core::db::Database;
use allot_core::services::limits::{
    Allowance, CheckReason, DocumentStore, LimitDefinition, LimitKind, LimitService,
    LimitServiceFactory, ManualClock, OverrideState, ResetPeriod, RollbackRequest,
    StaticConfigResolver, UsageMetadata,
};
use allot_core::{EngineSettings, Error};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

fn base_three(_tier: &str) -> Allowance {
    Allowance::Limited(3)
}

fn three_per_lifetime() -> LimitDefinition {
    LimitDefinition::new("test limit", "test", base_three)
        .with_field_name("test")
        .with_reset_period(ResetPeriod::None)
}

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");
    let db = Database::open(db_path).await.expect("Failed to create test database");
    (db, temp_dir)
}

fn factory(db: &Database, clock: &ManualClock, resolver: StaticConfigResolver) -> LimitServiceFactory {
    LimitServiceFactory::new(Arc::new(db.document_store()), Arc::new(resolver))
        .with_clock(Arc::new(clock.clone()))
        .with_settings(EngineSettings {
            max_transaction_attempts: 10,
            ..EngineSettings::default()
        })
}

async fn setup(definition: LimitDefinition) -> (LimitService, ManualClock, Database, TempDir) {
    let (db, dir) = create_test_db().await;
    let clock = ManualClock::new(t0());
    let service = factory(&db, &clock, StaticConfigResolver::default())
        .create(definition)
        .expect("valid definition");
    (service, clock, db, dir)
}

#[tokio::test]
async fn test_three_uses_then_denied() {
    let (service, _clock, _db, _dir) = setup(three_per_lifetime()).await;

    for expected in 1..=3 {
        assert!(service.can_use("u1", None).await.unwrap().allowed);
        let used = service.record_use("u1", None, None).await.unwrap();
        assert_eq!(used.count, expected);
    }

    let check = service.can_use("u1", None).await.unwrap();
    assert!(!check.allowed);
    assert_eq!(check.remaining, Allowance::Limited(0));
    assert_eq!(check.reason, Some(CheckReason::LimitExceeded));
}

#[tokio::test]
async fn test_ad_grant_expires() {
    let (service, clock, _db, _dir) = setup(three_per_lifetime()).await;
    for _ in 0..3 {
        service.record_use("u1", None, None).await.unwrap();
    }

    let ack = service.unlock_by_ad("u1", 2, None).await.unwrap();
    assert_eq!(ack.result.expires_at, t0() + Duration::hours(24));

    let check = service.can_use("u1", None).await.unwrap();
    assert!(check.allowed);
    assert_eq!(check.total, Allowance::Limited(5));
    assert_eq!(check.remaining, Allowance::Limited(2));
    assert_eq!(
        service.get_stats("u1", None).await.unwrap().override_state,
        OverrideState::AdBonusActive
    );

    clock.advance(Duration::hours(25));
    let check = service.can_use("u1", None).await.unwrap();
    assert!(!check.allowed);
    assert_eq!(check.total, Allowance::Limited(3));

    let err = service.record_use("u1", None, None).await.unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));
}

#[tokio::test]
async fn test_temporary_override_lapses() {
    let (service, clock, _db, _dir) = setup(three_per_lifetime()).await;
    service.set_count("u1", None, 3).await.unwrap();

    let ack = service.unlock_permanently("u1", None, Some(7)).await.unwrap();
    assert_eq!(ack.result.unlock_until, t0() + Duration::days(7));

    clock.advance(Duration::days(6));
    let check = service.can_use("u1", None).await.unwrap();
    assert_eq!(check.reason, Some(CheckReason::TemporaryUnlock));
    assert_eq!(check.remaining_days, Some(1));
    let used = service.record_use("u1", None, None).await.unwrap();
    assert_eq!(used.count, 4);

    clock.advance(Duration::days(2));
    let check = service.can_use("u1", None).await.unwrap();
    assert!(!check.allowed);
    assert_eq!(check.used, 4);

    let stats = service.get_stats("u1", None).await.unwrap();
    assert_eq!(stats.override_state, OverrideState::Normal);
}

#[tokio::test]
async fn test_rollback_with_key_applies_once() {
    let (service, _clock, _db, _dir) = setup(three_per_lifetime()).await;
    service.set_count("u1", None, 5).await.unwrap();

    let first = service
        .decrement_use("u1", None, RollbackRequest::with_key("x"))
        .await
        .unwrap();
    assert_eq!(first.result.previous_count, 5);
    assert_eq!(first.result.new_count, 4);

    let second = service
        .decrement_use("u1", None, RollbackRequest::with_key("x"))
        .await
        .unwrap();
    assert!(second.result.idempotent);
    assert_eq!(second.result.decremented, 0);
    assert_eq!(service.get_stats("u1", None).await.unwrap().used, 4);
}

#[tokio::test]
async fn test_rollback_by_event_id() {
    let (service, _clock, _db, _dir) = setup(three_per_lifetime()).await;
    let used = service.record_use("u1", None, None).await.unwrap();
    let request = RollbackRequest::with_key(used.event_id.to_string());

    service.decrement_use("u1", None, request.clone()).await.unwrap();
    service.decrement_use("u1", None, request).await.unwrap();
    assert_eq!(service.get_stats("u1", None).await.unwrap().used, 0);
}

#[tokio::test]
async fn test_metadata_with_reserved_keys_keeps_record_readable() {
    let (service, _clock, _db, _dir) = setup(three_per_lifetime()).await;
    let mut metadata = UsageMetadata::new();
    metadata.insert("timestamp".to_string(), serde_json::json!("client-side"));
    metadata.insert("eventId".to_string(), serde_json::json!("client-side"));

    let used = service.record_use("u1", None, Some(metadata)).await.unwrap();
    assert_eq!(used.count, 1);
    service.clear_cache();

    assert_eq!(service.get_stats("u1", None).await.unwrap().used, 1);
    let rollback = service
        .decrement_use("u1", None, RollbackRequest::default())
        .await
        .unwrap();
    assert_eq!(rollback.result.new_count, 0);
    assert_eq!(service.record_use("u1", None, None).await.unwrap().count, 1);
}

#[tokio::test]
async fn test_daily_reset_keeps_grants_and_overrides() {
    let definition = three_per_lifetime().with_reset_period(ResetPeriod::Daily);
    let (service, clock, db, _dir) = setup(definition).await;

    for _ in 0..3 {
        service.record_use("u1", None, None).await.unwrap();
    }
    service.purchase_cards("u1", 1, None).await.unwrap();
    service.unlock_by_ad("u1", 1, None).await.unwrap();

    clock.advance(Duration::days(1));
    let stats = service.get_stats("u1", None).await.unwrap();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.ads_watched_today, 0);
    assert_eq!(stats.cards, 1);
    assert_eq!(stats.lifetime_used, 3);
    assert_eq!(stats.last_reset_date.as_deref(), Some("2026-03-03"));

    service.record_use("u1", None, None).await.unwrap();
    let doc = db.document_store().get("u1").await.unwrap().unwrap();
    assert_eq!(doc.fields["test"]["count"], 1);
    assert_eq!(doc.fields["test"]["lastResetDate"], "2026-03-03");
    // the expired ad grant was pruned inside the write; the addon stays
    let grants = doc.fields["test"]["unlockHistory"].as_array().unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0]["unlockType"], "purchase");
}

#[tokio::test]
async fn test_concurrent_record_use_grants_exactly_one() {
    let (service, _clock, _db, _dir) = setup(three_per_lifetime()).await;
    service.set_count("u1", None, 2).await.unwrap();

    let service = Arc::new(service);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move { service.record_use("u1", None, None).await }));
    }

    let mut successes = 0;
    let mut exceeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(Error::QuotaExceeded { .. }) => exceeded += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(exceeded, 7);
    assert_eq!(service.get_stats("u1", None).await.unwrap().used, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_record_use_multi_thread() {
    let (service, _clock, _db, _dir) = setup(three_per_lifetime()).await;
    service.set_count("u1", None, 2).await.unwrap();

    let service = Arc::new(service);
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.record_use("u1", None, None).await.is_ok() })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn test_catalog_guest_policy() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(t0());
    let factory = factory(&db, &clock, StaticConfigResolver::default());

    let photos = factory.create(LimitKind::Photos.definition()).unwrap();
    let check = photos.can_use("guest", None).await.unwrap();
    assert!(!check.allowed);
    assert_eq!(check.reason, Some(CheckReason::GuestNotAllowed));
    assert!(matches!(
        photos.record_use("guest", None, None).await,
        Err(Error::GuestNotAllowed(_))
    ));

    let conversation = factory.create(LimitKind::Conversation.definition()).unwrap();
    assert!(conversation.record_use("guest", Some("char-1"), None).await.is_ok());
    assert!(matches!(
        conversation.record_use("guest", None, None).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_tiers_and_test_accounts() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(t0());
    let resolver = StaticConfigResolver::new("free")
        .with_user_tier("vip-user", "vip")
        .with_test_account("qa");
    let photos = factory(&db, &clock, resolver)
        .create(LimitKind::Photos.definition())
        .unwrap();

    assert_eq!(photos.can_use("someone", None).await.unwrap().limit, Allowance::Limited(3));
    assert_eq!(photos.can_use("vip-user", None).await.unwrap().limit, Allowance::Limited(0));

    let stats = photos.get_stats("qa", None).await.unwrap();
    assert!(stats.is_test_account);
    assert_eq!(stats.limit, Allowance::Limited(100));
    assert_eq!(stats.standard_limit, Allowance::Limited(3));
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("reopen.db");
    let clock = ManualClock::new(t0());

    {
        let db = Database::open(db_path.clone()).await.unwrap();
        let service = factory(&db, &clock, StaticConfigResolver::default())
            .create(three_per_lifetime())
            .unwrap();
        service.record_use("u1", None, None).await.unwrap();
        service.set_permanent_unlock("u1", None, true).await.unwrap();
        db.pool.close().await;
    }

    let db = Database::open(db_path).await.unwrap();
    let service = factory(&db, &clock, StaticConfigResolver::default())
        .create(three_per_lifetime())
        .unwrap();
    let stats = service.get_stats("u1", None).await.unwrap();
    assert_eq!(stats.used, 1);
    assert_eq!(stats.override_state, OverrideState::PermanentOverride);
}

#[tokio::test]
async fn test_legacy_cards_field_is_migrated() {
    let (service, _clock, db, _dir) = setup(three_per_lifetime()).await;

    let data = serde_json::json!({
        "userId": "legacy",
        "createdAt": "2025-01-01T00:00:00Z",
        "updatedAt": "2025-01-01T00:00:00Z",
        "test": { "count": 3, "cards": 2, "unlocked": 7 }
    });
    sqlx::query(
        "INSERT INTO usage_limits (user_id, data, version, created_at, updated_at) VALUES (?, ?, 1, ?, ?)",
    )
    .bind("legacy")
    .bind(data.to_string())
    .bind("2025-01-01T00:00:00Z")
    .bind("2025-01-01T00:00:00Z")
    .execute(&db.pool)
    .await
    .unwrap();

    let check = service.can_use("legacy", None).await.unwrap();
    assert!(check.allowed);
    assert_eq!(check.total, Allowance::Limited(5));

    let stats = service.get_stats("legacy", None).await.unwrap();
    assert_eq!(stats.cards, 2);
    assert_eq!(stats.unlocked, 7);
}

#[tokio::test]
async fn test_admin_listing() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(t0());
    let voice = factory(&db, &clock, StaticConfigResolver::default())
        .create(LimitKind::Voice.definition())
        .unwrap();

    voice.record_use("u1", Some("a"), None).await.unwrap();
    voice.record_use("u1", Some("b"), None).await.unwrap();
    voice.record_use("u2", Some("a"), None).await.unwrap();

    let characters = voice.get_character_stats("u1").await.unwrap();
    assert_eq!(characters.characters.len(), 2);
    assert_eq!(characters.characters["a"].used, 1);
    assert_eq!(characters.limit_per_character, Allowance::Limited(10));

    let all = voice.get_all_stats().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].user_id, "u1");
    assert_eq!(all[0].records.len(), 2);

    let cleared = voice.clear_all().await.unwrap();
    assert_eq!(cleared.result.cleared_count, 2);
    assert!(voice.get_all_stats().await.unwrap().is_empty());
}
