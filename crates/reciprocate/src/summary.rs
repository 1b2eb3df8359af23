//! Run summaries handed to notifiers.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::ErrorClass;

/// The three scheduled jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Verify,
    Cleanup,
    RetryDrain,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Verify => "verify",
            JobKind::Cleanup => "cleanup",
            JobKind::RetryDrain => "retry_drain",
        }
    }

    /// Human-readable name used in notifications.
    pub fn title(&self) -> &'static str {
        match self {
            JobKind::Verify => "Engagement verification",
            JobKind::Cleanup => "Verification cleanup",
            JobKind::RetryDrain => "Retry queue drain",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lookup that was not retried, kept for the operator report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLookup {
    pub owner: Option<String>,
    pub shortcode: String,
    pub class: ErrorClass,
    pub error: String,
}

/// What one run did. Counters only ever grow during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub job: JobKind,
    pub run_id: Uuid,
    pub week: Option<NaiveDate>,
    pub account: Option<String>,
    /// Size of the work set fixed at the start of the run.
    pub total: usize,
    /// Lookups that succeeded and were reconciled.
    pub checked: usize,
    pub added: usize,
    pub removed: usize,
    /// Records looked at by cleanup and left in place.
    pub kept: usize,
    /// Retryable failures sent to the retry queue.
    pub queued: usize,
    /// Skip or unknown failures, never retried.
    pub skipped: usize,
    /// Links without a recognisable post key.
    pub invalid_links: usize,
    /// Drained items that failed again and went back to pending.
    pub retry_failed: usize,
    /// Drained items moved to the dead-letter state.
    pub dead_lettered: usize,
    pub critical_abort: bool,
    pub error: Option<String>,
    pub failures: Vec<FailedLookup>,
}

impl RunSummary {
    pub fn new(job: JobKind) -> Self {
        Self {
            job,
            run_id: Uuid::new_v4(),
            week: None,
            account: None,
            total: 0,
            checked: 0,
            added: 0,
            removed: 0,
            kept: 0,
            queued: 0,
            skipped: 0,
            invalid_links: 0,
            retry_failed: 0,
            dead_lettered: 0,
            critical_abort: false,
            error: None,
            failures: Vec::new(),
        }
    }

    /// Every item that did not reconcile in this run.
    pub fn failed(&self) -> usize {
        self.queued + self.skipped + self.retry_failed + self.dead_lettered
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Counter fields in display order, for notifications.
    pub fn counters(&self) -> Vec<(&'static str, usize)> {
        let mut fields = vec![("Total", self.total), ("Checked", self.checked)];
        match self.job {
            JobKind::Verify => {
                fields.push(("Added", self.added));
                fields.push(("Queued", self.queued));
            }
            JobKind::Cleanup => {
                fields.push(("Removed", self.removed));
                fields.push(("Kept", self.kept));
                fields.push(("Queued", self.queued));
            }
            JobKind::RetryDrain => {
                fields.push(("Added", self.added));
                fields.push(("Removed", self.removed));
                fields.push(("Retry failed", self.retry_failed));
                fields.push(("Dead-lettered", self.dead_lettered));
            }
        }
        fields.push(("Skipped", self.skipped));
        if self.invalid_links > 0 {
            fields.push(("Invalid links", self.invalid_links));
        }
        fields
    }
}

/// Receives the summary at the end of every run, successful or not.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivery problems are the notifier's own to log; they never fail a run.
    async fn notify(&self, summary: &RunSummary);
}

/// Discards summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _summary: &RunSummary) {}
}
