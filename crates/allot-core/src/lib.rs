//! # allot-core
//!
//! Quota and entitlement engine - shared by the CLI and embedding services.
//!
//! This crate provides:
//! - Usage limit services (`services::limits` module)
//! - Database bootstrap (`db` module)
//! - Engine settings (`settings` module)
//! - Unified error handling (`error` module)

pub mod db;
pub mod error;
pub mod services;
pub mod settings;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};
pub use settings::EngineSettings;

// Re-export commonly used types from services
pub use services::limits::{
    Allowance, CanUseResponse, ConfigResolver, DocumentStore, EntitlementRecord, GuestIdentity,
    LimitDefinition, LimitKind, LimitService, LimitServiceFactory, LimitStats, MemoryDocumentStore,
    ResetPeriod, RollbackRequest, SqliteDocumentStore, StaticConfigResolver,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
