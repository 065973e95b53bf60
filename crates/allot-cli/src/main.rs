//! Allot CLI - Usage quota administration
//!
//! A command-line interface for checking, recording and administering
//! per-user usage limits stored in a local SQLite database.

mod commands;
mod output;

use std::sync::Arc;

use allot_core::{EngineSettings, LimitServiceFactory, StaticConfigResolver};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "allot")]
#[command(author, version, about = "Usage quota administration CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override database path (or set ALLOT_DB_PATH env var)
    #[arg(long, env = "ALLOT_DB_PATH", global = true)]
    db: Option<String>,

    /// Membership tier for users without an explicit assignment
    #[arg(long, env = "ALLOT_DEFAULT_TIER", global = true, default_value = "free")]
    tier: String,

    /// Assign a tier to a user, as USER=TIER (repeatable)
    #[arg(long = "user-tier", global = true, value_parser = commands::parse_key_value)]
    user_tiers: Vec<(String, String)>,

    /// Treat a user as a test account (repeatable)
    #[arg(long = "test-account", global = true)]
    test_accounts: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check and record usage for a user
    Usage {
        #[command(subcommand)]
        action: commands::usage::UsageAction,
    },

    /// Administrative overrides, resets and listings
    Admin {
        #[command(subcommand)]
        action: commands::admin::AdminAction,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    // Set up database path if provided
    if let Some(db_path) = &cli.db {
        std::env::set_var(allot_core::db::DB_PATH_ENV, db_path);
    }

    // Initialize database
    let db = allot_core::Database::new().await?;

    let mut resolver = StaticConfigResolver::new(cli.tier.clone());
    for (user, tier) in cli.user_tiers {
        resolver = resolver.with_user_tier(user, tier);
    }
    for user in cli.test_accounts {
        resolver = resolver.with_test_account(user);
    }

    let factory = LimitServiceFactory::new(Arc::new(db.document_store()), Arc::new(resolver))
        .with_settings(EngineSettings::from_env());

    // Create context for commands
    let ctx = commands::Context {
        factory,
        default_tier: cli.tier,
        format: cli.format,
        quiet: cli.quiet,
    };

    // Execute command
    match cli.command {
        Commands::Usage { action } => commands::usage::execute(&ctx, action).await,
        Commands::Admin { action } => commands::admin::execute(&ctx, action).await,
        Commands::Config { action } => commands::config::execute(&ctx, action).await,
    }
}
