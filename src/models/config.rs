//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::RetryPolicy;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Portal endpoints and HTTP behavior
    #[serde(default)]
    pub portal: PortalConfig,

    /// Browser automation used for the credential exchange
    #[serde(default)]
    pub auth: AuthConfig,

    /// Pagination and target filtering
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Retry policy for failed page requests
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Relational store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Exclusivity gate settings
    #[serde(default)]
    pub gate: GateConfig,

    /// Where the target school list comes from
    #[serde(default)]
    pub roster: RosterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.portal.login_url)?;
        url::Url::parse(&self.portal.listing_url)?;
        url::Url::parse(&self.auth.webdriver_url)?;

        if self.portal.user_agent.trim().is_empty() {
            return Err(AppError::validation("portal.user_agent is empty"));
        }
        if self.portal.academic_year_id.trim().is_empty() {
            return Err(AppError::validation("portal.academic_year_id is empty"));
        }
        if self.portal.timeout_secs == 0 {
            return Err(AppError::validation("portal.timeout_secs must be > 0"));
        }
        if self.harvest.page_size == 0 {
            return Err(AppError::validation("harvest.page_size must be > 0"));
        }
        if self.retry.max_consecutive_errors == 0 {
            return Err(AppError::validation(
                "retry.max_consecutive_errors must be > 0",
            ));
        }
        if self.auth.form_wait_secs == 0 || self.auth.token_wait_secs == 0 {
            return Err(AppError::validation("auth wait bounds must be > 0"));
        }
        if self.auth.token_storage_key.trim().is_empty() {
            return Err(AppError::validation("auth.token_storage_key is empty"));
        }
        if self.gate.stale_after_secs == 0 {
            return Err(AppError::validation("gate.stale_after_secs must be > 0"));
        }
        if let RosterConfig::Database {
            table,
            id_column,
            name_column,
            ..
        } = &self.roster
        {
            for ident in [table, id_column, name_column] {
                if !is_sql_identifier(ident) {
                    return Err(AppError::validation(format!(
                        "roster identifier '{ident}' is not a plain SQL identifier"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Table and column names are interpolated into SQL, so keep them boring.
fn is_sql_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Portal endpoints and HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Page hosting the interactive login form
    #[serde(default = "defaults::login_url")]
    pub login_url: String,

    /// Paged student listing endpoint
    #[serde(default = "defaults::listing_url")]
    pub listing_url: String,

    /// Academic term sent as `anoLetivoId` on every listing request
    #[serde(default = "defaults::academic_year_id")]
    pub academic_year_id: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: defaults::login_url(),
            listing_url: defaults::listing_url(),
            academic_year_id: defaults::academic_year_id(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// WebDriver login settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of a running WebDriver server (chromedriver, geckodriver)
    #[serde(default = "defaults::webdriver_url")]
    pub webdriver_url: String,

    /// Browser arguments for the isolated, headless session
    #[serde(default = "defaults::browser_args")]
    pub browser_args: Vec<String>,

    /// CSS selector of the identifier input
    #[serde(default = "defaults::identifier_selector")]
    pub identifier_selector: String,

    /// CSS selector of the secret input
    #[serde(default = "defaults::secret_selector")]
    pub secret_selector: String,

    /// CSS selector of the submit control
    #[serde(default = "defaults::submit_selector")]
    pub submit_selector: String,

    /// localStorage key the portal writes its token under
    #[serde(default = "defaults::token_storage_key")]
    pub token_storage_key: String,

    /// Upper bound for the login form to appear
    #[serde(default = "defaults::form_wait")]
    pub form_wait_secs: u64,

    /// Upper bound for the token to appear after submitting
    #[serde(default = "defaults::token_wait")]
    pub token_wait_secs: u64,

    /// Polling interval while waiting on the page
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            webdriver_url: defaults::webdriver_url(),
            browser_args: defaults::browser_args(),
            identifier_selector: defaults::identifier_selector(),
            secret_selector: defaults::secret_selector(),
            submit_selector: defaults::submit_selector(),
            token_storage_key: defaults::token_storage_key(),
            form_wait_secs: defaults::form_wait(),
            token_wait_secs: defaults::token_wait(),
            poll_interval_ms: defaults::poll_interval(),
        }
    }
}

/// Pagination and target filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Records requested per page
    #[serde(default = "defaults::page_size")]
    pub page_size: u32,

    /// School names excluded from every run (exact match)
    #[serde(default = "defaults::blocklist")]
    pub blocklist: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_size: defaults::page_size(),
            blocklist: defaults::blocklist(),
        }
    }
}

/// SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file shared with the reporting dashboard
    #[serde(default = "defaults::database_path")]
    pub path: PathBuf,

    /// How long a connection waits on a locked database
    #[serde(default = "defaults::busy_timeout")]
    pub busy_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: defaults::database_path(),
            busy_timeout_secs: defaults::busy_timeout(),
        }
    }
}

/// Exclusivity gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Marker file whose existence means a run is in progress
    #[serde(default = "defaults::marker_path")]
    pub marker_path: PathBuf,

    /// Age after which a lease is considered abandoned
    #[serde(default = "defaults::stale_after")]
    pub stale_after_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            marker_path: defaults::marker_path(),
            stale_after_secs: defaults::stale_after(),
        }
    }
}

/// Source of the target school list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RosterConfig {
    /// A table owned by another collector, read-only here
    Database {
        /// Database holding the table; defaults to the store database
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default = "defaults::roster_table")]
        table: String,
        #[serde(default = "defaults::roster_id_column")]
        id_column: String,
        #[serde(default = "defaults::roster_name_column")]
        name_column: String,
    },
    /// A JSON file of `{ "id", "name" }` objects
    File { path: PathBuf },
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self::Database {
            path: None,
            table: defaults::roster_table(),
            id_column: defaults::roster_id_column(),
            name_column: defaults::roster_name_column(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Portal defaults
    pub fn login_url() -> String {
        "https://escola.see.pb.gov.br".into()
    }
    pub fn listing_url() -> String {
        "https://api.escola.see.pb.gov.br/api/Estudante/visao-gre-2025/".into()
    }
    pub fn academic_year_id() -> String {
        "50018994-3fec-4ed7-baec-cc3b869ade81".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; enrollment-harvester/0.1)".into()
    }
    pub fn timeout() -> u64 {
        10
    }

    // Auth defaults
    pub fn webdriver_url() -> String {
        "http://localhost:9515".into()
    }
    pub fn browser_args() -> Vec<String> {
        [
            "--headless",
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--window-size=1920,1080",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn identifier_selector() -> String {
        "input[name='cpf']".into()
    }
    pub fn secret_selector() -> String {
        "input[type='password']".into()
    }
    pub fn submit_selector() -> String {
        "button".into()
    }
    pub fn token_storage_key() -> String {
        "seectpb.token".into()
    }
    pub fn form_wait() -> u64 {
        20
    }
    pub fn token_wait() -> u64 {
        8
    }
    pub fn poll_interval() -> u64 {
        500
    }

    // Harvest defaults
    pub fn page_size() -> u32 {
        100
    }
    pub fn blocklist() -> Vec<String> {
        vec!["EEEF MANUEL BARBOSA DE LUCENA".into()]
    }

    // Store defaults
    pub fn database_path() -> PathBuf {
        PathBuf::from("quadro_aulas.db")
    }
    pub fn busy_timeout() -> u64 {
        30
    }

    // Gate defaults
    pub fn marker_path() -> PathBuf {
        PathBuf::from("harvest.lock")
    }
    pub fn stale_after() -> u64 {
        6 * 60 * 60
    }

    // Roster defaults
    pub fn roster_table() -> String {
        "professores_rede".into()
    }
    pub fn roster_id_column() -> String {
        "escola_id".into()
    }
    pub fn roster_name_column() -> String {
        "escola_nome".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
