// src/services/harvester.rs

//! Paginated harvester.
//!
//! Walks one school's listing page by page until an empty page comes
//! back, upserting every non-empty page as soon as it arrives.

use crate::error::FetchError;
use crate::models::{BearerToken, RetryPolicy, TargetSchool};
use crate::services::ListingSource;
use crate::storage::SnapshotStore;

/// How pagination of one target ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// An empty page was returned
    Exhausted,
    /// Too many consecutive failures on `page`
    Aborted { page: u32, last_error: String },
}

/// Summary of one target's harvest.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub school: TargetSchool,
    /// Non-empty pages received
    pub pages: u32,
    /// Records received from the source, including ones that failed to persist
    pub received: usize,
    /// Rows written to the snapshot
    pub written: usize,
    /// Pages whose upsert failed
    pub persist_failures: usize,
    /// Failed requests, including retried ones
    pub fetch_failures: usize,
    pub termination: Termination,
}

impl HarvestReport {
    fn new(school: &TargetSchool) -> Self {
        Self {
            school: school.clone(),
            pages: 0,
            received: 0,
            written: 0,
            persist_failures: 0,
            fetch_failures: 0,
            termination: Termination::Exhausted,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.termination, Termination::Aborted { .. })
    }
}

/// Paginates targets into the snapshot store.
pub struct Harvester<'a> {
    source: &'a dyn ListingSource,
    snapshot: &'a dyn SnapshotStore,
    retry: &'a RetryPolicy,
}

impl<'a> Harvester<'a> {
    pub fn new(
        source: &'a dyn ListingSource,
        snapshot: &'a dyn SnapshotStore,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            source,
            snapshot,
            retry,
        }
    }

    /// Harvest every page of `target`.
    ///
    /// Never fails: transient errors are retried on the same page and,
    /// past the retry limit, end the target with [`Termination::Aborted`].
    /// Data already written for the target is kept.
    pub async fn harvest(&self, token: &BearerToken, target: &TargetSchool) -> HarvestReport {
        let mut report = HarvestReport::new(target);
        let mut page: u32 = 1;
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.source.fetch_page(token, &target.id, page).await {
                Ok(records) if records.is_empty() => {
                    log::debug!("{}: page {} empty, listing exhausted", target.name, page);
                    report.termination = Termination::Exhausted;
                    break;
                }
                Ok(records) => {
                    consecutive_errors = 0;
                    report.pages += 1;
                    report.received += records.len();

                    match self.snapshot.upsert_batch(&records, &target.name, &target.id) {
                        Ok(written) => report.written += written,
                        Err(e) => {
                            report.persist_failures += 1;
                            log::error!(
                                "{}: failed to save page {} ({} records): {}",
                                target.name,
                                page,
                                records.len(),
                                e
                            );
                        }
                    }

                    log::debug!(
                        "{}: page {} -> {} records ({} so far)",
                        target.name,
                        page,
                        records.len(),
                        report.received
                    );
                    page += 1;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    report.fetch_failures += 1;
                    log::warn!(
                        "{}: page {} failed ({}/{}): {}",
                        target.name,
                        page,
                        consecutive_errors,
                        self.retry.max_consecutive_errors,
                        e
                    );

                    if self.retry.exhausted(consecutive_errors) {
                        report.termination = Termination::Aborted {
                            page,
                            last_error: e.to_string(),
                        };
                        break;
                    }
                    self.back_off(consecutive_errors, &e).await;
                }
            }
        }

        if let Termination::Aborted { page, last_error } = &report.termination {
            log::error!(
                "{}: abandoned at page {} after {} consecutive failures (last: {}); keeping {} records",
                target.name,
                page,
                consecutive_errors,
                last_error,
                report.received
            );
        }

        report
    }

    async fn back_off(&self, consecutive_errors: u32, error: &FetchError) {
        if let Some(delay) = self.retry.delay_for(consecutive_errors, error.is_explicit()) {
            tokio::time::sleep(delay).await;
        }
    }
}
