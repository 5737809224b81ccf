// src/pipeline/orchestrator.rs

//! Run orchestration.
//!
//! A run takes the exclusivity gate, exchanges credentials for a token,
//! clears the snapshot and harvests every target in order, appending one
//! history row per target. The gate is released on every path.

use chrono::{DateTime, Local, Utc};

use crate::error::{AppError, GateError, Result};
use crate::models::{BearerToken, Credentials, RetryPolicy, TargetSchool};
use crate::pipeline::ExclusivityGate;
use crate::services::{Authenticator, HarvestReport, Harvester, ListingSource};
use crate::storage::{HistoryRecorder, SnapshotStore};
use crate::utils::percent;

/// Receives completion updates after each target.
pub trait ProgressSink: Send + Sync {
    /// `fraction` is in `[0, 1]`.
    fn update(&self, fraction: f64, label: &str);
}

/// Writes progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn update(&self, fraction: f64, label: &str) {
        log::info!("{:>4} {}", percent(fraction), label);
    }
}

/// Result of a completed sweep.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rows removed from the previous snapshot
    pub cleared: usize,
    /// One report per target, in harvest order
    pub targets: Vec<HarvestReport>,
}

impl RunReport {
    pub fn received(&self) -> usize {
        self.targets.iter().map(|t| t.received).sum()
    }

    pub fn written(&self) -> usize {
        self.targets.iter().map(|t| t.written).sum()
    }

    pub fn aborted(&self) -> impl Iterator<Item = &HarvestReport> {
        self.targets.iter().filter(|t| t.is_aborted())
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another run holds the gate
    Busy {
        owner: String,
        acquired_at: DateTime<Utc>,
    },
    /// No token could be obtained; the store was not touched
    AuthenticationFailed,
}

/// Sequences gate, authentication and harvesting for a whole run.
pub struct Orchestrator<'a> {
    gate: &'a ExclusivityGate,
    authenticator: &'a dyn Authenticator,
    source: &'a dyn ListingSource,
    snapshot: &'a dyn SnapshotStore,
    history: &'a dyn HistoryRecorder,
    retry: RetryPolicy,
    progress: &'a dyn ProgressSink,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        gate: &'a ExclusivityGate,
        authenticator: &'a dyn Authenticator,
        source: &'a dyn ListingSource,
        snapshot: &'a dyn SnapshotStore,
        history: &'a dyn HistoryRecorder,
    ) -> Self {
        Self {
            gate,
            authenticator,
            source,
            snapshot,
            history,
            retry: RetryPolicy::default(),
            progress: &LogProgress,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Run a full harvest under the gate.
    ///
    /// Busy and authentication failures are outcomes, not errors. Errors
    /// are reserved for the store or the gate itself misbehaving.
    pub async fn run(
        &self,
        credentials: Credentials,
        targets: &[TargetSchool],
    ) -> Result<RunOutcome> {
        if targets.is_empty() {
            return Err(AppError::validation("no targets to harvest"));
        }

        let guard = match self.gate.acquire() {
            Ok(guard) => guard,
            Err(GateError::Busy { owner, acquired_at }) => {
                log::warn!(
                    "Harvest already running (owner {}, since {}), skipping",
                    owner,
                    acquired_at
                );
                return Ok(RunOutcome::Busy { owner, acquired_at });
            }
            Err(e) => return Err(e.into()),
        };
        log::debug!("Running as gate owner {}", guard.lease().owner);

        let token = match self.authenticator.authenticate(credentials).await {
            Ok(token) => token,
            Err(e) => {
                log::error!("Authentication failed, aborting run");
                log::debug!("Authentication error: {}", e);
                guard.release()?;
                return Ok(RunOutcome::AuthenticationFailed);
            }
        };
        log::info!("Authenticated");

        let swept = self.sweep(&token, targets).await;
        let released = guard.release();

        let report = swept?;
        released?;
        Ok(RunOutcome::Completed(report))
    }

    /// Clear the snapshot and harvest every target in order.
    ///
    /// Target-level failures are logged and do not stop the sweep.
    pub async fn sweep(&self, token: &BearerToken, targets: &[TargetSchool]) -> Result<RunReport> {
        let started_at = Utc::now();
        let total = targets.len();

        let cleared = self.snapshot.replace_all()?;
        log::info!("Snapshot cleared ({} rows removed)", cleared);

        let harvester = Harvester::new(self.source, self.snapshot, &self.retry);
        let mut reports = Vec::with_capacity(total);

        for (i, target) in targets.iter().enumerate() {
            let report = harvester.harvest(token, target).await;

            if let Err(e) = self.history.append(
                &target.name,
                &target.id,
                report.received,
                Local::now().naive_local(),
            ) {
                log::error!("{}: failed to record history: {}", target.name, e);
            }

            log::info!(
                "{}: {} records in {} pages{}",
                target.name,
                report.received,
                report.pages,
                if report.is_aborted() { " (aborted)" } else { "" }
            );

            let done = i + 1;
            self.progress.update(
                done as f64 / total as f64,
                &format!("[{}/{}] {}", done, total, target.name),
            );
            reports.push(report);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            cleared,
            targets: reports,
        };

        log::info!(
            "Sweep finished: {} targets, {} records received, {} written, {} aborted",
            report.targets.len(),
            report.received(),
            report.written(),
            report.aborted().count()
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::error::{AuthError, FetchError};
    use crate::models::StudentRecord;
    use crate::pipeline::GateStatus;
    use crate::services::PresetTokenAuthenticator;
    use crate::services::listing::scripted::{ScriptedSource, students};
    use crate::storage::SqliteStore;

    #[derive(Default)]
    struct RecordingProgress {
        updates: Mutex<Vec<(f64, String)>>,
    }

    impl ProgressSink for RecordingProgress {
        fn update(&self, fraction: f64, label: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((fraction, label.to_string()));
        }
    }

    /// Always rejects, counting attempts.
    #[derive(Default)]
    struct RejectingAuthenticator {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for RejectingAuthenticator {
        async fn authenticate(
            &self,
            _credentials: Credentials,
        ) -> std::result::Result<BearerToken, AuthError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::Rejected)
        }
    }

    struct Fixture {
        _tmp: TempDir,
        store: SqliteStore,
        gate: ExclusivityGate,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::new(tmp.path().join("harvest.db"), Duration::from_secs(1));
        store.initialize().unwrap();
        let gate = ExclusivityGate::new(tmp.path().join("harvest.lock"), Duration::from_secs(3600));
        Fixture {
            _tmp: tmp,
            store,
            gate,
        }
    }

    fn preset() -> PresetTokenAuthenticator {
        PresetTokenAuthenticator::new(BearerToken::sanitize("token").unwrap())
    }

    fn credentials() -> Credentials {
        Credentials::new("operator", "secret")
    }

    fn schools() -> Vec<TargetSchool> {
        vec![
            TargetSchool::new("A", "Escola A"),
            TargetSchool::new("B", "Escola B"),
        ]
    }

    #[tokio::test]
    async fn test_run_two_schools_end_to_end() {
        let fx = fixture();
        let auth = preset();
        let source = ScriptedSource::new()
            .script("A", vec![Ok(students("a1", 5)), Ok(students("a2", 3)), Ok(vec![])])
            .script("B", vec![Ok(vec![])]);
        let progress = RecordingProgress::default();

        let outcome = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .with_retry(RetryPolicy::immediate(3))
            .with_progress(&progress)
            .run(credentials(), &schools())
            .await
            .unwrap();

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(report.received(), 8);
        assert_eq!(fx.store.count().unwrap(), 8);

        let latest = fx.store.latest().unwrap();
        let counts: Vec<(&str, i64)> = latest
            .iter()
            .map(|e| (e.school_id.as_str(), e.count))
            .collect();
        assert!(counts.contains(&("A", 8)));
        assert!(counts.contains(&("B", 0)));

        let updates = progress.updates.lock().unwrap().clone();
        assert_eq!(
            updates,
            vec![
                (0.5, "[1/2] Escola A".to_string()),
                (1.0, "[2/2] Escola B".to_string()),
            ]
        );
        assert_eq!(fx.gate.status().unwrap(), GateStatus::Free);
    }

    #[tokio::test]
    async fn test_aborted_target_does_not_stop_the_run() {
        let fx = fixture();
        let auth = preset();
        let source = ScriptedSource::new()
            .script(
                "A",
                vec![
                    Err(FetchError::Status(500)),
                    Err(FetchError::Status(500)),
                    Err(FetchError::Status(500)),
                ],
            )
            .script("B", vec![Ok(students("b", 2)), Ok(vec![])]);

        let outcome = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .with_retry(RetryPolicy::immediate(3))
            .with_progress(&RecordingProgress::default())
            .run(credentials(), &schools())
            .await
            .unwrap();

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(report.aborted().count(), 1);
        assert_eq!(fx.store.count().unwrap(), 2);
        assert_eq!(fx.store.series("A").unwrap()[0].count, 0);
        assert_eq!(fx.store.series("B").unwrap()[0].count, 2);
    }

    #[tokio::test]
    async fn test_sweep_replaces_previous_snapshot() {
        let fx = fixture();
        let auth = preset();
        fx.store
            .upsert_batch(&students("old", 4), "Escola Z", "Z")
            .unwrap();
        let source = ScriptedSource::new().script("A", vec![Ok(students("new", 1))]);
        let progress = RecordingProgress::default();
        let orchestrator = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .with_retry(RetryPolicy::immediate(3))
            .with_progress(&progress);

        let token = BearerToken::sanitize("token").unwrap();
        let report = orchestrator
            .sweep(&token, &[TargetSchool::new("A", "Escola A")])
            .await
            .unwrap();

        assert_eq!(report.cleared, 4);
        assert_eq!(fx.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_leaves_store_untouched() {
        let fx = fixture();
        fx.store
            .upsert_batch(&students("old", 3), "Escola A", "A")
            .unwrap();
        let auth = RejectingAuthenticator::default();
        let source = ScriptedSource::new();

        let outcome = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .run(credentials(), &schools())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::AuthenticationFailed));
        assert_eq!(fx.store.count().unwrap(), 3);
        assert!(source.calls().is_empty());
        assert!(fx.store.latest().unwrap().is_empty());
        assert_eq!(fx.gate.status().unwrap(), GateStatus::Free);
    }

    #[tokio::test]
    async fn test_busy_gate_skips_authentication() {
        let fx = fixture();
        let _held = fx.gate.acquire().unwrap();
        let auth = RejectingAuthenticator::default();
        let source = ScriptedSource::new();

        let outcome = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .run(credentials(), &schools())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Busy { .. }));
        assert_eq!(auth.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_target_list_is_rejected_before_gate() {
        let fx = fixture();
        let auth = preset();
        let source = ScriptedSource::new();

        let err = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .run(credentials(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert!(!fx.gate.marker_path().exists());
    }

    #[tokio::test]
    async fn test_store_failure_still_releases_gate() {
        let tmp = TempDir::new().unwrap();
        // No schema: clearing the snapshot fails.
        let store = SqliteStore::new(tmp.path().join("bare.db"), Duration::from_secs(1));
        let gate = ExclusivityGate::new(tmp.path().join("harvest.lock"), Duration::from_secs(3600));
        let auth = preset();
        let source = ScriptedSource::new();

        let err = Orchestrator::new(&gate, &auth, &source, &store, &store)
            .with_progress(&RecordingProgress::default())
            .run(credentials(), &schools())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Sqlite(_)));
        assert!(source.calls().is_empty());
        assert_eq!(gate.status().unwrap(), GateStatus::Free);
    }

    #[tokio::test]
    async fn test_keyless_records_count_in_history_only() {
        let fx = fixture();
        let auth = preset();
        let mut page = students("a", 2);
        page.push(StudentRecord {
            name: "Sem Matricula".to_string(),
            ..StudentRecord::default()
        });
        let source = ScriptedSource::new().script("A", vec![Ok(page)]);

        let outcome = Orchestrator::new(&fx.gate, &auth, &source, &fx.store, &fx.store)
            .with_retry(RetryPolicy::immediate(3))
            .with_progress(&RecordingProgress::default())
            .run(credentials(), &[TargetSchool::new("A", "Escola A")])
            .await
            .unwrap();

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(report.received(), 3);
        assert_eq!(report.written(), 2);
        assert_eq!(fx.store.count().unwrap(), 2);
        assert_eq!(fx.store.series("A").unwrap()[0].count, 3);
    }
}
