// src/models/mod.rs

//! Domain models for the harvester.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod retry;
mod school;
mod student;
mod token;

// Re-export all public types
pub use config::{
    AuthConfig, Config, GateConfig, HarvestConfig, LoggingConfig, PortalConfig, RosterConfig,
    StoreConfig,
};
pub use retry::{Backoff, BackoffCurve, RetryPolicy};
pub use school::{TargetSchool, apply_blocklist};
pub use student::{ListingData, ListingPayload, NestedPage, StudentRecord};
pub use token::{BearerToken, Credentials};

/// One row of the append-only history table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: String,
    pub school_name: String,
    pub school_id: String,
    pub count: i64,
}
