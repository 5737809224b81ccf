//! Enrollment Harvester CLI
//!
//! Local execution entry point. Exit codes: 0 completed, 2 another run
//! holds the gate, 3 authentication failed, 1 any other error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use harvester::{
    error::{AppError, Result},
    models::{BearerToken, Config, Credentials, apply_blocklist},
    pipeline::{ExclusivityGate, GateStatus, Orchestrator, RunOutcome},
    services::{Authenticator, HttpListingSource, PresetTokenAuthenticator, WebDriverAuthenticator},
    storage::{self, HistoryRecorder, SnapshotStore, SqliteStore},
};

const EXIT_BUSY: u8 = 2;
const EXIT_AUTH_FAILED: u8 = 3;

/// Harvester - School Enrollment Snapshot Collector
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Harvests per-school enrollment listings into a local snapshot"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "harvest.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harvest every roster target into the snapshot
    Run {
        /// Portal login identifier
        #[arg(long, env = "HARVEST_IDENTIFIER", hide_env_values = true)]
        identifier: Option<String>,

        /// Portal login secret
        #[arg(long, env = "HARVEST_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Use an already issued bearer token instead of logging in
        #[arg(long, env = "HARVEST_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Show gate state, snapshot size and latest history
    Status,

    /// Force-release the gate, recording why
    Unlock {
        /// Reason written to the audit log
        #[arg(long)]
        reason: String,
    },

    /// List roster targets after blocklist filtering
    Targets,

    /// Validate the configuration file
    Validate,

    /// Create the snapshot and history tables
    InitDb,
}

/// Initialize logging based on verbosity flag and configured level.
fn init_logging(verbose: bool, configured: &str) {
    let level = if verbose { "debug" } else { configured };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Load the configuration, falling back to defaults once logging is up.
fn load_config(cli: &Cli) -> Config {
    let loaded = Config::load(&cli.config);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    loaded.unwrap_or_else(|e| {
        log::warn!(
            "Config load failed from {}: {}. Using defaults.",
            cli.config.display(),
            e
        );
        Config::default()
    })
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(&cli);

    match execute(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli, config: Config) -> Result<ExitCode> {
    let store = SqliteStore::from_config(&config.store);
    let gate = ExclusivityGate::from_config(&config.gate);

    match cli.command {
        Command::Run {
            identifier,
            secret,
            token,
        } => {
            config.validate()?;

            let targets = apply_blocklist(
                storage::roster::from_config(&config).targets()?,
                &config.harvest.blocklist,
            );
            log::info!("Loaded {} targets", targets.len());

            let (authenticator, credentials): (Box<dyn Authenticator>, Credentials) = match token {
                Some(raw) => {
                    let token = BearerToken::sanitize(&raw)
                        .ok_or_else(|| AppError::config("--token is blank"))?;
                    (
                        Box::new(PresetTokenAuthenticator::new(token)),
                        Credentials::new("", ""),
                    )
                }
                None => {
                    let credentials = Credentials::new(
                        identifier.unwrap_or_default(),
                        secret.unwrap_or_default(),
                    );
                    if !credentials.is_complete() {
                        return Err(AppError::config(
                            "credentials required: set HARVEST_IDENTIFIER and HARVEST_SECRET or pass --token",
                        ));
                    }
                    (Box::new(WebDriverAuthenticator::new(&config)?), credentials)
                }
            };

            store.initialize()?;
            let source = HttpListingSource::new(&config)?;

            let outcome = Orchestrator::new(&gate, authenticator.as_ref(), &source, &store, &store)
                .with_retry(config.retry.clone())
                .run(credentials, &targets)
                .await?;

            match outcome {
                RunOutcome::Completed(report) => {
                    for aborted in report.aborted() {
                        log::warn!("Incomplete: {}", aborted.school.name);
                    }
                    log::info!(
                        "Run complete: {} records from {} schools in {}s",
                        report.received(),
                        report.targets.len(),
                        report.elapsed().num_seconds()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                RunOutcome::Busy { owner, acquired_at } => {
                    log::warn!("Another run ({}) has held the gate since {}", owner, acquired_at);
                    Ok(ExitCode::from(EXIT_BUSY))
                }
                RunOutcome::AuthenticationFailed => {
                    log::error!("Authentication failed. Check the credentials and the WebDriver service.");
                    Ok(ExitCode::from(EXIT_AUTH_FAILED))
                }
            }
        }

        Command::Status => {
            match gate.status()? {
                GateStatus::Free => log::info!("Gate: free"),
                GateStatus::Held(lease) => log::info!(
                    "Gate: held by {} (pid {} on {}) since {}",
                    lease.owner,
                    lease.pid,
                    lease.host,
                    lease.acquired_at
                ),
                GateStatus::Unreadable { modified_at } => {
                    log::info!("Gate: marker present but unreadable (modified {})", modified_at)
                }
            }

            if !store.path().exists() {
                log::info!("No database at {}", store.path().display());
                return Ok(ExitCode::SUCCESS);
            }

            log::info!("Snapshot: {} students", store.count()?);
            for row in store.count_by_school()? {
                log::info!("  {} ({}): {}", row.school_name, row.school_id, row.count);
            }

            let latest = store.latest()?;
            if latest.is_empty() {
                log::info!("No history recorded yet.");
            }
            for entry in latest {
                log::info!(
                    "  last seen {} {}: {}",
                    entry.timestamp,
                    entry.school_name,
                    entry.count
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Unlock { reason } => {
            let had_marker = gate.marker_path().exists();
            match gate.force_release(&reason)? {
                Some(lease) => log::warn!(
                    "Released gate held by {} since {} (audit: {})",
                    lease.owner,
                    lease.acquired_at,
                    gate.audit_path().display()
                ),
                None if had_marker => {
                    log::warn!("Removed unreadable marker {}", gate.marker_path().display())
                }
                None => log::info!("Gate was not held"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Targets => {
            let targets = apply_blocklist(
                storage::roster::from_config(&config).targets()?,
                &config.harvest.blocklist,
            );
            for target in &targets {
                println!("{}\t{}", target.id, target.name);
            }
            log::info!("{} targets", targets.len());
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK");
            Ok(ExitCode::SUCCESS)
        }

        Command::InitDb => {
            store.initialize()?;
            log::info!("Tables ready in {}", store.path().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
