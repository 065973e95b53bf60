//! Period rollover
//!
//! Decides whether a record's recurring counter belongs to an earlier period
//! and, if so, rolls it over. Grants, addons and overrides are left alone:
//! they expire by their own timestamps, not by the reset cadence.

use chrono::{DateTime, Datelike, Duration, Utc};

use super::types::{EntitlementRecord, ResetPeriod};

/// Key identifying the period containing `now`, or `None` for cadences that
/// never roll over.
///
/// - daily: `YYYY-MM-DD`
/// - weekly: `YYYY-MM-DD` of the Monday starting the week
/// - monthly: `YYYY-MM`
pub fn period_key(period: ResetPeriod, now: DateTime<Utc>) -> Option<String> {
    let today = now.date_naive();
    match period {
        ResetPeriod::None | ResetPeriod::Lifetime => None,
        ResetPeriod::Daily => Some(today.format("%Y-%m-%d").to_string()),
        ResetPeriod::Weekly => {
            let offset = i64::from(today.weekday().num_days_from_monday());
            let monday = today - Duration::days(offset);
            Some(monday.format("%Y-%m-%d").to_string())
        }
        ResetPeriod::Monthly => Some(today.format("%Y-%m").to_string()),
    }
}

/// Roll the record over if its stored period differs from the current one.
///
/// An unset `lastResetDate` is initialised without zeroing anything; that is
/// first-use bootstrap, not a reset. Returns `true` only for a real rollover.
pub fn check_and_reset(record: &mut EntitlementRecord, period: ResetPeriod, now: DateTime<Utc>) -> bool {
    let Some(current) = period_key(period, now) else {
        return false;
    };

    match record.last_reset_date.as_deref() {
        None => {
            record.last_reset_date = Some(current);
            false
        }
        Some(stored) if stored == current => false,
        Some(_) => {
            record.count = 0;
            record.unlocked = 0;
            record.ads_watched_today = 0;
            record.last_ad_time = None;
            record.last_reset_date = Some(current);
            true
        }
    }
}

/// Zero the informational daily ad counter once the last ad falls on an
/// earlier UTC day, whatever the record's own cadence.
pub fn check_and_reset_ad_counter(record: &mut EntitlementRecord, now: DateTime<Utc>) -> bool {
    match record.last_ad_time {
        Some(last) if last.date_naive() < now.date_naive() && record.ads_watched_today > 0 => {
            record.ads_watched_today = 0;
            true
        }
        _ => false,
    }
}

/// Period rollover followed by the daily ad-counter rollover.
///
/// Returns `true` if either changed the record.
pub fn check_and_reset_all(record: &mut EntitlementRecord, period: ResetPeriod, now: DateTime<Utc>) -> bool {
    let bootstrap = record.last_reset_date.is_none() && period_key(period, now).is_some();
    let period_reset = check_and_reset(record, period, now);
    let ad_reset = check_and_reset_ad_counter(record, now);
    period_reset || ad_reset || bootstrap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::limits::types::Grant;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_period_keys() {
        // 2026-03-12 is a Thursday
        let now = at(2026, 3, 12);
        assert_eq!(period_key(ResetPeriod::Daily, now).unwrap(), "2026-03-12");
        assert_eq!(period_key(ResetPeriod::Weekly, now).unwrap(), "2026-03-09");
        assert_eq!(period_key(ResetPeriod::Monthly, now).unwrap(), "2026-03");
        assert!(period_key(ResetPeriod::None, now).is_none());
        assert!(period_key(ResetPeriod::Lifetime, now).is_none());
    }

    #[test]
    fn test_weekly_key_on_monday_and_sunday() {
        assert_eq!(period_key(ResetPeriod::Weekly, at(2026, 3, 9)).unwrap(), "2026-03-09");
        assert_eq!(period_key(ResetPeriod::Weekly, at(2026, 3, 15)).unwrap(), "2026-03-09");
        assert_eq!(period_key(ResetPeriod::Weekly, at(2026, 3, 16)).unwrap(), "2026-03-16");
    }

    #[test]
    fn test_bootstrap_is_not_a_reset() {
        let mut record = EntitlementRecord {
            count: 2,
            ..Default::default()
        };
        assert!(!check_and_reset(&mut record, ResetPeriod::Daily, at(2026, 3, 12)));
        assert_eq!(record.count, 2);
        assert_eq!(record.last_reset_date.as_deref(), Some("2026-03-12"));
    }

    #[test]
    fn test_daily_reset_keeps_grants_and_overrides() {
        let now = at(2026, 3, 12);
        let mut record = EntitlementRecord {
            count: 7,
            lifetime_count: 40,
            unlocked: 4,
            cards: 2,
            ads_watched_today: 3,
            last_ad_time: Some(now - Duration::days(1)),
            permanent_unlock: true,
            last_reset_date: Some("2026-03-11".to_string()),
            ..Default::default()
        };
        record.grants.push(Grant::ad(2, now - Duration::hours(2)));
        record.grants.push(Grant::PurchasedAddon {
            amount: 2,
            purchased_at: None,
        });

        assert!(check_and_reset(&mut record, ResetPeriod::Daily, now));
        assert_eq!(record.count, 0);
        assert_eq!(record.ads_watched_today, 0);
        assert_eq!(record.legacy_unlocked(), 0);
        assert!(record.last_ad_time.is_none());
        assert_eq!(record.last_reset_date.as_deref(), Some("2026-03-12"));

        assert_eq!(record.lifetime_count, 40);
        assert_eq!(record.grants.len(), 2);
        assert_eq!(record.cards(), 2);
        assert!(record.permanent_unlock);
    }

    #[test]
    fn test_same_period_is_untouched() {
        let mut record = EntitlementRecord {
            count: 5,
            last_reset_date: Some("2026-03".to_string()),
            ..Default::default()
        };
        assert!(!check_and_reset(&mut record, ResetPeriod::Monthly, at(2026, 3, 30)));
        assert_eq!(record.count, 5);
        assert!(check_and_reset(&mut record, ResetPeriod::Monthly, at(2026, 4, 1)));
        assert_eq!(record.count, 0);
    }

    #[test]
    fn test_lifetime_never_resets() {
        let mut record = EntitlementRecord {
            count: 3,
            last_reset_date: Some("2020-01-01".to_string()),
            ..Default::default()
        };
        assert!(!check_and_reset(&mut record, ResetPeriod::Lifetime, at(2026, 3, 12)));
        assert!(!check_and_reset(&mut record, ResetPeriod::None, at(2026, 3, 12)));
        assert_eq!(record.count, 3);
    }

    #[test]
    fn test_ad_counter_resets_daily_for_non_daily_cadence() {
        let now = at(2026, 3, 12);
        let mut record = EntitlementRecord {
            count: 2,
            ads_watched_today: 4,
            last_ad_time: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert!(check_and_reset_all(&mut record, ResetPeriod::None, now));
        assert_eq!(record.ads_watched_today, 0);
        assert_eq!(record.count, 2);
        assert!(!check_and_reset_all(&mut record, ResetPeriod::None, now));
    }
}
