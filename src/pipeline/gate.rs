//! Exclusivity gate.
//!
//! A marker file whose existence means "a harvest run is in progress".
//! The marker carries a lease (owner token, pid, host, acquisition time):
//!
//! - `acquire()` creates the marker atomically; an existing, fresh lease
//!   makes it fail with [`GateError::Busy`].
//! - A lease older than `stale_after` is reclaimed so a crashed holder
//!   cannot block future runs forever.
//! - [`GateGuard`] removes the marker when dropped, but only while it
//!   still carries the guard's own owner token.
//! - `force_release(reason)` clears any marker and appends an audit line
//!   to `<marker>.audit.log`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GateError;
use crate::models::GateConfig;

type GateResult<T> = std::result::Result<T, GateError>;

const ACQUIRE_ATTEMPTS: usize = 3;
const UNKNOWN_OWNER: &str = "unknown";

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Random token identifying the holder
    pub owner: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    fn new() -> Self {
        Self {
            owner: owner_token(),
            pid: std::process::id(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| UNKNOWN_OWNER.to_string()),
            acquired_at: Utc::now(),
        }
    }
}

/// What an operator sees when inspecting the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Free,
    Held(Lease),
    /// A marker exists but carries no readable lease
    Unreadable { modified_at: DateTime<Utc> },
}

/// One audit log line.
#[derive(Debug, Serialize, Deserialize)]
struct AuditEntry {
    at: DateTime<Utc>,
    action: String,
    reason: String,
    displaced: Option<Lease>,
}

/// Filesystem-backed mutual exclusion between harvest runs.
#[derive(Debug, Clone)]
pub struct ExclusivityGate {
    marker: PathBuf,
    stale_after: chrono::Duration,
}

impl ExclusivityGate {
    pub fn new(marker: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            marker: marker.into(),
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(
            &config.marker_path,
            Duration::from_secs(config.stale_after_secs),
        )
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Path of the audit log kept next to the marker.
    pub fn audit_path(&self) -> PathBuf {
        let mut path = self.marker.as_os_str().to_owned();
        path.push(".audit.log");
        PathBuf::from(path)
    }

    /// Take the gate, reclaiming an abandoned lease if necessary.
    pub fn acquire(&self) -> GateResult<GateGuard> {
        let mut last_busy = None;

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self.try_create() {
                Ok(lease) => {
                    log::info!("Gate acquired ({})", self.marker.display());
                    return Ok(GateGuard {
                        gate: self.clone(),
                        lease,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(GateError::Io(e)),
            }

            let status = self.status()?;
            let (owner, since) = match &status {
                // Holder released between our attempts.
                GateStatus::Free => continue,
                GateStatus::Held(lease) => (lease.owner.clone(), lease.acquired_at),
                GateStatus::Unreadable { modified_at } => (UNKNOWN_OWNER.to_string(), *modified_at),
            };

            if !self.is_stale(since) {
                last_busy = Some(GateError::Busy {
                    owner,
                    acquired_at: since,
                });
                break;
            }

            // Whether or not the reclaim wins, the next attempt re-reads
            // whatever marker is in place.
            self.reclaim(&status)?;
        }

        Err(last_busy.unwrap_or_else(|| GateError::Busy {
            owner: UNKNOWN_OWNER.to_string(),
            acquired_at: Utc::now(),
        }))
    }

    /// Inspect the marker without touching it.
    pub fn status(&self) -> GateResult<GateStatus> {
        read_status(&self.marker)
    }

    /// Remove the marker if it still belongs to `owner`.
    ///
    /// Returns whether a marker was removed. Releasing a gate that is not
    /// held, or held by someone else, is a no-op.
    pub fn release(&self, owner: &str) -> GateResult<bool> {
        match self.status()? {
            GateStatus::Held(lease) if lease.owner == owner => {
                self.remove_marker()?;
                log::info!("Gate released ({})", self.marker.display());
                Ok(true)
            }
            GateStatus::Held(lease) => {
                log::warn!(
                    "Gate marker now belongs to {} (pid {}); leaving it in place",
                    lease.owner,
                    lease.pid
                );
                Ok(false)
            }
            GateStatus::Unreadable { .. } => {
                log::warn!("Gate marker is unreadable; leaving it in place");
                Ok(false)
            }
            GateStatus::Free => Ok(false),
        }
    }

    /// Operator override: clear any marker and record why.
    ///
    /// Returns the displaced lease, if one was readable.
    pub fn force_release(&self, reason: &str) -> GateResult<Option<Lease>> {
        let displaced = match self.status()? {
            GateStatus::Free => {
                log::info!("Gate is not held; nothing to release");
                return Ok(None);
            }
            GateStatus::Held(lease) => Some(lease),
            GateStatus::Unreadable { .. } => None,
        };

        self.remove_marker()?;
        self.audit("force_release", reason, displaced.clone())?;
        log::warn!("Gate force-released: {}", reason);
        Ok(displaced)
    }

    fn try_create(&self) -> std::io::Result<Lease> {
        if let Some(parent) = self.marker.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.marker)?;
        let lease = Lease::new();
        let body = serde_json::to_vec_pretty(&lease)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(lease)
    }

    /// Remove a marker judged stale, provided it is still the one in `seen`.
    ///
    /// The marker is first moved aside atomically, so a contender that
    /// reclaimed and re-acquired in the meantime is detected and its marker
    /// put back. Returns whether the stale marker was removed.
    fn reclaim(&self, seen: &GateStatus) -> GateResult<bool> {
        let parked = self.parked_path();
        match fs::rename(&self.marker, &parked) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(GateError::Io(e)),
        }

        let taken = read_status(&parked)?;
        if taken == GateStatus::Free {
            return Ok(false);
        }
        if !same_marker(seen, &taken) {
            log::info!(
                "Gate marker {} changed hands before it could be reclaimed",
                self.marker.display()
            );
            self.restore(&parked)?;
            return Ok(false);
        }

        log::warn!(
            "Reclaiming stale gate marker {} (older than {}s)",
            self.marker.display(),
            self.stale_after.num_seconds()
        );
        remove_if_present(&parked)?;
        let displaced = match taken {
            GateStatus::Held(lease) => Some(lease),
            _ => None,
        };
        self.audit("reclaim_stale", "lease exceeded staleness timeout", displaced)?;
        Ok(true)
    }

    /// Put a parked marker back without clobbering a newer one.
    fn restore(&self, parked: &Path) -> GateResult<()> {
        match fs::hard_link(parked, &self.marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                log::error!(
                    "Gate marker {} was recreated while a live lease was parked; keeping the newer one",
                    self.marker.display()
                );
            }
            // No hard links on this filesystem.
            Err(_) => {
                fs::rename(parked, &self.marker)?;
                return Ok(());
            }
        }
        remove_if_present(parked)
    }

    fn parked_path(&self) -> PathBuf {
        let mut path = self.marker.as_os_str().to_owned();
        path.push(format!(".reclaim-{}", owner_token()));
        PathBuf::from(path)
    }

    fn is_stale(&self, since: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(since) > self.stale_after
    }

    fn remove_marker(&self) -> GateResult<()> {
        remove_if_present(&self.marker)
    }

    fn audit(&self, action: &str, reason: &str, displaced: Option<Lease>) -> GateResult<()> {
        let entry = AuditEntry {
            at: Utc::now(),
            action: action.to_string(),
            reason: reason.to_string(),
            displaced,
        };
        let mut line = serde_json::to_string(&entry).map_err(std::io::Error::from)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Proof of holding the gate. Releases on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: ExclusivityGate,
    lease: Lease,
    released: bool,
}

impl GateGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release explicitly, surfacing any I/O error.
    pub fn release(mut self) -> GateResult<bool> {
        self.released = true;
        self.gate.release(&self.lease.owner)
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.gate.release(&self.lease.owner) {
            log::error!("Failed to release gate {}: {}", self.gate.marker.display(), e);
        }
    }
}

fn read_status(path: &Path) -> GateResult<GateStatus> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(GateStatus::Free),
        Err(e) => return Err(GateError::Io(e)),
    };

    match serde_json::from_str::<Lease>(&content) {
        Ok(lease) => Ok(GateStatus::Held(lease)),
        Err(_) => {
            let modified_at = match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(GateStatus::Free),
                Err(e) => return Err(GateError::Io(e)),
            };
            Ok(GateStatus::Unreadable { modified_at })
        }
    }
}

/// Whether two observations describe the same marker file contents.
fn same_marker(a: &GateStatus, b: &GateStatus) -> bool {
    match (a, b) {
        (GateStatus::Held(x), GateStatus::Held(y)) => x.owner == y.owner,
        (GateStatus::Unreadable { modified_at: x }, GateStatus::Unreadable { modified_at: y }) => {
            x == y
        }
        _ => false,
    }
}

fn remove_if_present(path: &Path) -> GateResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GateError::Io(e)),
    }
}

fn owner_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(seq.to_le_bytes());
    hex::encode(&hasher.finalize()[..8])
}
