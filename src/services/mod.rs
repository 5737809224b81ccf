//! Service layer for the harvester.
//!
//! This module contains the business logic for:
//! - Credential exchange (`WebDriverAuthenticator`)
//! - Listing pages (`HttpListingSource`)
//! - Per-school pagination (`Harvester`)

mod auth;
mod harvester;
pub(crate) mod listing;

pub use auth::{Authenticator, PresetTokenAuthenticator, WebDriverAuthenticator};
pub use harvester::{HarvestReport, Harvester, Termination};
pub use listing::{HttpListingSource, ListingSource};
