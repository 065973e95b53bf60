//! Usage commands
//!
//! Check, record and roll back uses, and grant bonus allowance.

use allot_core::services::limits::{CanUseResponse, LimitKind, LimitStats, UsageMetadata};
use allot_core::RollbackRequest;
use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use super::{parse_key_value, Context};
use crate::output::{
    or_dash, print_detail, print_json, print_single, print_success, print_warning, FieldRow,
    OutputFormat,
};

#[derive(Subcommand)]
pub enum UsageAction {
    /// Check whether a user may use a limit type right now
    Check {
        /// Limit type (conversation, voice, photos, videos, character_creation)
        kind: LimitKind,
        /// User ID
        user: String,
        /// Character ID (required for per-character limits)
        #[arg(long, short)]
        character: Option<String>,
    },

    /// Record one use, failing if the quota is exhausted
    Use {
        kind: LimitKind,
        user: String,
        #[arg(long, short)]
        character: Option<String>,
        /// Attach metadata as KEY=VALUE (repeatable)
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Give back one use after a failed operation
    Rollback {
        kind: LimitKind,
        user: String,
        #[arg(long, short)]
        character: Option<String>,
        /// Idempotency key; repeating a key is a no-op
        #[arg(long)]
        key: Option<String>,
        /// Reason recorded in the history
        #[arg(long)]
        reason: Option<String>,
    },

    /// Grant extra uses for 24 hours (ad reward)
    GrantAd {
        kind: LimitKind,
        user: String,
        /// Number of extra uses
        #[arg(long, default_value_t = 1)]
        amount: u32,
        #[arg(long, short)]
        character: Option<String>,
    },

    /// Lift the limit for a number of days
    Unlock {
        kind: LimitKind,
        user: String,
        #[arg(long, short)]
        character: Option<String>,
        /// Override length in days (default 7)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Add permanent addon uses (deprecated, prefer the asset ledger)
    Cards {
        kind: LimitKind,
        user: String,
        /// Number of addon uses
        amount: u32,
        #[arg(long, short)]
        character: Option<String>,
    },

    /// Show the full usage snapshot
    Stats {
        kind: LimitKind,
        user: String,
        #[arg(long, short)]
        character: Option<String>,
    },
}

/// Check result row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct CheckRow {
    #[tabled(rename = "Allowed")]
    pub allowed: String,
    #[tabled(rename = "Used")]
    pub used: u32,
    #[tabled(rename = "Total")]
    pub total: String,
    #[tabled(rename = "Remaining")]
    pub remaining: String,
    #[tabled(rename = "Tier")]
    pub tier: String,
    #[tabled(rename = "Reason")]
    pub reason: String,
}

impl From<&CanUseResponse> for CheckRow {
    fn from(check: &CanUseResponse) -> Self {
        Self {
            allowed: if check.allowed { "yes" } else { "no" }.to_string(),
            used: check.used,
            total: check.total.to_string(),
            remaining: check.remaining.to_string(),
            tier: check.tier.clone(),
            reason: check
                .reason
                .and_then(|r| serde_json::to_value(r).ok())
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn execute(ctx: &Context, action: UsageAction) -> Result<()> {
    match action {
        UsageAction::Check { kind, user, character } => check(ctx, kind, &user, character.as_deref()).await,
        UsageAction::Use {
            kind,
            user,
            character,
            metadata,
        } => record(ctx, kind, &user, character.as_deref(), metadata).await,
        UsageAction::Rollback {
            kind,
            user,
            character,
            key,
            reason,
        } => rollback(ctx, kind, &user, character.as_deref(), key, reason).await,
        UsageAction::GrantAd {
            kind,
            user,
            amount,
            character,
        } => grant_ad(ctx, kind, &user, amount, character.as_deref()).await,
        UsageAction::Unlock {
            kind,
            user,
            character,
            days,
        } => unlock(ctx, kind, &user, character.as_deref(), days).await,
        UsageAction::Cards {
            kind,
            user,
            amount,
            character,
        } => cards(ctx, kind, &user, amount, character.as_deref()).await,
        UsageAction::Stats { kind, user, character } => stats(ctx, kind, &user, character.as_deref()).await,
    }
}

async fn check(ctx: &Context, kind: LimitKind, user: &str, character: Option<&str>) -> Result<()> {
    let service = ctx.service(kind)?;
    let result = service.can_use(user, character).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            print_single(&CheckRow::from(&result), ctx.format)?;
            if !result.allowed {
                print_warning(&format!("{} is not available for {}", kind, user), ctx.quiet);
            }
        }
    }
    Ok(())
}

async fn record(
    ctx: &Context,
    kind: LimitKind,
    user: &str,
    character: Option<&str>,
    metadata: Vec<(String, String)>,
) -> Result<()> {
    let service = ctx.service(kind)?;
    let metadata = if metadata.is_empty() {
        None
    } else {
        Some(
            metadata
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect::<UsageMetadata>(),
        )
    };

    let result = service.record_use(user, character, metadata).await?;
    match ctx.format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => print_success(
            &format!(
                "Recorded {} use for {} ({} used of {}), event {}",
                kind, user, result.count, result.total_allowed, result.event_id
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn rollback(
    ctx: &Context,
    kind: LimitKind,
    user: &str,
    character: Option<&str>,
    key: Option<String>,
    reason: Option<String>,
) -> Result<()> {
    let service = ctx.service(kind)?;
    let request = RollbackRequest {
        idempotency_key: key,
        reason,
    };
    let ack = service.decrement_use(user, character, request).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table if ack.result.idempotent => {
            print_warning("Rollback already applied for this key, nothing changed", ctx.quiet)
        }
        OutputFormat::Table => print_success(
            &format!(
                "Rolled back {} for {}: {} -> {}",
                kind, user, ack.result.previous_count, ack.result.new_count
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn grant_ad(ctx: &Context, kind: LimitKind, user: &str, amount: u32, character: Option<&str>) -> Result<()> {
    let service = ctx.service(kind)?;
    let ack = service.unlock_by_ad(user, amount, character).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(
            &format!(
                "Granted {} extra {} uses to {} until {} ({} ads today)",
                amount,
                kind,
                user,
                ack.result.expires_at.format("%Y-%m-%d %H:%M UTC"),
                ack.result.ads_watched_today
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn unlock(ctx: &Context, kind: LimitKind, user: &str, character: Option<&str>, days: Option<u32>) -> Result<()> {
    let service = ctx.service(kind)?;
    let ack = service.unlock_permanently(user, character, days).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(
            &format!(
                "Unlocked {} for {} for {} days (until {})",
                kind,
                user,
                ack.result.days,
                ack.result.unlock_until.format("%Y-%m-%d %H:%M UTC")
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn cards(ctx: &Context, kind: LimitKind, user: &str, amount: u32, character: Option<&str>) -> Result<()> {
    let service = ctx.service(kind)?;
    let ack = service.purchase_cards(user, amount, character).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(
            &format!(
                "Added {} {} addon uses for {} (total {})",
                amount, kind, user, ack.result.total_cards
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn stats(ctx: &Context, kind: LimitKind, user: &str, character: Option<&str>) -> Result<()> {
    let service = ctx.service(kind)?;
    let stats = service.get_stats(user, character).await?;
    print_detail(&stats, stats_rows(&stats), ctx.format)
}

fn stats_rows(stats: &LimitStats) -> Vec<FieldRow> {
    vec![
        FieldRow::new("Tier", &stats.tier),
        FieldRow::new("Limit", stats.limit),
        FieldRow::new("Standard limit", stats.standard_limit),
        FieldRow::new("Test account", stats.is_test_account),
        FieldRow::new("Used", stats.used),
        FieldRow::new("Total", stats.total),
        FieldRow::new("Remaining", stats.remaining),
        FieldRow::new("Override", stats.override_state),
        FieldRow::new("Override until", or_dash(stats.temporary_unlock_until)),
        FieldRow::new("Active ad grants", stats.active_ad_grants),
        FieldRow::new("Addon uses", stats.cards),
        FieldRow::new("Ads watched today", stats.ads_watched_today),
        FieldRow::new("Lifetime used", stats.lifetime_used),
        FieldRow::new("Period", or_dash(stats.last_reset_date.as_deref())),
        FieldRow::new("Last used", or_dash(stats.last_used_at)),
    ]
}
