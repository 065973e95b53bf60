//! Services module

pub mod limits;

pub use limits::{LimitKind, LimitService, LimitServiceFactory};
