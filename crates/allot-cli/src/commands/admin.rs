//! Admin commands
//!
//! Overrides, count corrections, resets and listings.

use allot_core::LimitKind;
use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{or_dash, print_info, print_json, print_output, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum AdminAction {
    /// Set (or clear with --off) the non-expiring override
    Permanent {
        kind: LimitKind,
        user: String,
        #[arg(long, short)]
        character: Option<String>,
        /// Clear the override instead of setting it
        #[arg(long)]
        off: bool,
    },

    /// Overwrite the current period count
    SetCount {
        kind: LimitKind,
        user: String,
        count: u32,
        #[arg(long, short)]
        character: Option<String>,
    },

    /// Restore a record to its initial state (all characters if none given)
    Reset {
        kind: LimitKind,
        user: String,
        #[arg(long, short)]
        character: Option<String>,
    },

    /// Per-character breakdown for a user
    Characters { kind: LimitKind, user: String },

    /// List every user holding records for a limit type
    List { kind: LimitKind },

    /// Remove a limit type from every user
    Clear {
        kind: LimitKind,
        /// Confirm the bulk delete
        #[arg(long)]
        yes: bool,
    },
}

/// Character row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct CharacterRow {
    #[tabled(rename = "Character")]
    pub character: String,
    #[tabled(rename = "Used")]
    pub used: u32,
    #[tabled(rename = "Total")]
    pub total: String,
    #[tabled(rename = "Remaining")]
    pub remaining: String,
    #[tabled(rename = "Lifetime")]
    pub lifetime: u32,
    #[tabled(rename = "Override")]
    pub override_state: String,
}

/// Record row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct RecordRow {
    #[tabled(rename = "User")]
    pub user: String,
    #[tabled(rename = "Character")]
    pub character: String,
    #[tabled(rename = "Count")]
    pub count: u32,
    #[tabled(rename = "Lifetime")]
    pub lifetime: u32,
    #[tabled(rename = "Override")]
    pub override_state: String,
    #[tabled(rename = "Updated")]
    pub updated: String,
}

pub async fn execute(ctx: &Context, action: AdminAction) -> Result<()> {
    match action {
        AdminAction::Permanent {
            kind,
            user,
            character,
            off,
        } => permanent(ctx, kind, &user, character.as_deref(), !off).await,
        AdminAction::SetCount {
            kind,
            user,
            count,
            character,
        } => set_count(ctx, kind, &user, count, character.as_deref()).await,
        AdminAction::Reset { kind, user, character } => reset(ctx, kind, &user, character.as_deref()).await,
        AdminAction::Characters { kind, user } => characters(ctx, kind, &user).await,
        AdminAction::List { kind } => list(ctx, kind).await,
        AdminAction::Clear { kind, yes } => clear(ctx, kind, yes).await,
    }
}

async fn permanent(ctx: &Context, kind: LimitKind, user: &str, character: Option<&str>, enabled: bool) -> Result<()> {
    let service = ctx.service(kind)?;
    let ack = service.set_permanent_unlock(user, character, enabled).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(
            &format!(
                "Permanent {} override for {}: {}",
                kind,
                user,
                if enabled { "on" } else { "off" }
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn set_count(ctx: &Context, kind: LimitKind, user: &str, count: u32, character: Option<&str>) -> Result<()> {
    let service = ctx.service(kind)?;
    let ack = service.set_count(user, character, count).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(
            &format!(
                "Set {} count for {}: {} -> {}",
                kind, user, ack.result.previous_count, ack.result.new_count
            ),
            ctx.quiet,
        ),
    }
    Ok(())
}

async fn reset(ctx: &Context, kind: LimitKind, user: &str, character: Option<&str>) -> Result<()> {
    let service = ctx.service(kind)?;
    let ack = service.reset(user, character).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(&format!("{} for {}", ack.result.message, user), ctx.quiet),
    }
    Ok(())
}

async fn characters(ctx: &Context, kind: LimitKind, user: &str) -> Result<()> {
    let service = ctx.service(kind)?;
    let stats = service.get_character_stats(user).await?;

    if ctx.format == OutputFormat::Json {
        return print_json(&stats);
    }

    print_info(
        &format!(
            "{} tier, {} per character{}",
            stats.tier,
            stats.limit_per_character,
            if stats.is_test_account { " (test account)" } else { "" }
        ),
        ctx.quiet,
    );
    let rows: Vec<CharacterRow> = stats
        .characters
        .iter()
        .map(|(id, usage)| CharacterRow {
            character: id.clone(),
            used: usage.used,
            total: usage.total.to_string(),
            remaining: usage.remaining.to_string(),
            lifetime: usage.lifetime_used,
            override_state: usage.override_state.to_string(),
        })
        .collect();
    print_output(&rows, ctx.format)
}

async fn list(ctx: &Context, kind: LimitKind) -> Result<()> {
    let service = ctx.service(kind)?;
    let summaries = service.get_all_stats().await?;

    if ctx.format == OutputFormat::Json {
        return print_json(&summaries);
    }

    let rows: Vec<RecordRow> = summaries
        .iter()
        .flat_map(|summary| {
            summary.records.iter().map(move |record| RecordRow {
                user: summary.user_id.clone(),
                character: or_dash(record.character_id.as_deref()),
                count: record.count,
                lifetime: record.lifetime_count,
                override_state: record.override_state.to_string(),
                updated: summary.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            })
        })
        .collect();
    print_output(&rows, ctx.format)
}

async fn clear(ctx: &Context, kind: LimitKind, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear every {} record without --yes", kind);
    }

    let service = ctx.service(kind)?;
    let ack = service.clear_all().await?;

    match ctx.format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => print_success(
            &format!("Cleared {} from {} users", kind, ack.result.cleared_count),
            ctx.quiet,
        ),
    }
    Ok(())
}
