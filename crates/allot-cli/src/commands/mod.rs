//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod admin;
pub mod config;
pub mod usage;

use allot_core::{LimitKind, LimitService, LimitServiceFactory};
use anyhow::Result;

use crate::output::OutputFormat;

/// Shared context for all commands
pub struct Context {
    pub factory: LimitServiceFactory,
    pub default_tier: String,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    /// Limit service for a built-in limit type
    pub fn service(&self, kind: LimitKind) -> Result<LimitService> {
        Ok(self.factory.create(kind.definition())?)
    }
}

/// Parse a `KEY=VALUE` argument
pub fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("Expected KEY=VALUE, got '{}'", s)),
    }
}
