// src/error.rs

//! Unified error handling for the harvester.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// SQLite operation failed
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Credential exchange failed
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Exclusivity gate could not be taken or released
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure modes of a credential exchange.
///
/// Callers are expected to collapse every variant into a single
/// operator-facing message; the variant itself is informational.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The automation driver could not be reached or refused a session
    #[error("automation driver unavailable: {0}")]
    DriverUnavailable(String),

    /// The login form never appeared within the wait bound
    #[error("login form not found within {0}s")]
    LoginFormNotFound(u64),

    /// No token materialized after submitting the credentials
    #[error("credentials rejected or no token issued")]
    Rejected,

    /// The driver answered with something unexpected
    #[error("automation protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::DriverUnavailable(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

/// A single failed page request.
///
/// Every variant is treated as transient by the harvester.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The endpoint answered with a non-200 status
    #[error("unexpected status {0}")]
    Status(u16),

    /// The request never completed (connect, timeout, body read)
    #[error("transport failure: {0}")]
    Transport(String),

    /// The body was not a recognizable listing payload
    #[error("undecodable payload: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether the endpoint explicitly answered with a failure.
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Status(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Exclusivity gate errors.
#[derive(Error, Debug)]
pub enum GateError {
    /// Another run holds the gate
    #[error("harvest already in progress (owner {owner}, since {acquired_at})")]
    Busy {
        owner: String,
        acquired_at: DateTime<Utc>,
    },

    /// Marker file could not be read, written or removed
    #[error("marker I/O error: {0}")]
    Io(#[from] std::io::Error),
}
