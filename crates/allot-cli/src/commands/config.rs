//! Config commands
//!
//! Commands for inspecting engine configuration and the limit catalog.

use allot_core::settings::{ENV_CACHE_CAPACITY, ENV_CACHE_TTL_SECS, ENV_TX_ATTEMPTS};
use allot_core::{Allowance, LimitKind};
use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{or_dash, print_output};

const TIERS: [&str; 3] = ["free", "vip", "vvip"];

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// List the built-in limit types and their tier allowances
    Limits,
}

/// Config row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct ConfigRow {
    #[tabled(rename = "Key")]
    pub key: String,
    #[tabled(rename = "Value")]
    pub value: String,
    #[tabled(rename = "Source")]
    pub source: String,
}

/// Limit type row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct LimitRow {
    #[tabled(rename = "Limit")]
    pub kind: String,
    #[tabled(rename = "Reset")]
    pub reset: String,
    #[tabled(rename = "Per character")]
    pub per_character: bool,
    #[tabled(rename = "Guests")]
    pub guests: bool,
    #[tabled(rename = "free")]
    pub free: String,
    #[tabled(rename = "vip")]
    pub vip: String,
    #[tabled(rename = "vvip")]
    pub vvip: String,
    #[tabled(rename = "Test accounts")]
    pub test_accounts: String,
}

pub async fn execute(ctx: &Context, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => show_config(ctx),
        ConfigAction::Limits => list_limits(ctx),
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    let settings = ctx.factory.settings();
    let db_path = allot_core::db::get_db_path()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown".to_string());

    let rows = vec![
        row(allot_core::db::DB_PATH_ENV, db_path),
        row(ENV_CACHE_CAPACITY, settings.cache_capacity),
        row(ENV_CACHE_TTL_SECS, settings.cache_ttl_secs),
        row(ENV_TX_ATTEMPTS, settings.max_transaction_attempts),
        row("ALLOT_DEFAULT_TIER", &ctx.default_tier),
    ];
    print_output(&rows, ctx.format)
}

fn row(key: &str, value: impl std::fmt::Display) -> ConfigRow {
    ConfigRow {
        key: key.to_string(),
        value: value.to_string(),
        source: if std::env::var(key).is_ok() { "env" } else { "default" }.to_string(),
    }
}

fn list_limits(ctx: &Context) -> Result<()> {
    let rows: Vec<LimitRow> = LimitKind::ALL
        .iter()
        .map(|kind| {
            let def = kind.definition();
            let tier = |name: &str| (def.membership_limit)(name).to_string();
            LimitRow {
                kind: kind.to_string(),
                reset: def.reset_period.to_string(),
                per_character: def.per_character,
                guests: def.allow_guest,
                free: tier(TIERS[0]),
                vip: tier(TIERS[1]),
                vvip: tier(TIERS[2]),
                test_accounts: or_dash(def.test_account_limit.map(|a: Allowance| a.to_string())),
            }
        })
        .collect();
    print_output(&rows, ctx.format)
}
