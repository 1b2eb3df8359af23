//! Persistence ports.
//!
//! Policy-light interfaces: stores persist and enforce uniqueness, the engine
//! decides. Every write is committed on its own so an aborted run leaves
//! consistent partial progress.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{
    NewRetryItem, NewVerification, RetryQueueItem, RetryStatus, Roster, Submission,
    VerificationRecord,
};

/// Source of the active participant roster.
#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn roster(&self) -> anyhow::Result<Roster>;
}

/// Source of weekly submissions.
#[async_trait]
pub trait SubmissionProvider: Send + Sync {
    async fn submissions_for_week(&self, week: NaiveDate) -> anyhow::Result<Vec<Submission>>;
}

/// Storage for non-reciprocation records.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Insert unless a record for `(participant, link)` already exists.
    ///
    /// Returns the stored record, or `None` when one was already there.
    /// Must be atomic: two concurrent calls for the same pair insert once.
    async fn insert_if_absent(
        &self,
        record: NewVerification,
    ) -> anyhow::Result<Option<VerificationRecord>>;

    async fn records_for_link(&self, link: &str) -> anyhow::Result<Vec<VerificationRecord>>;

    /// Every record, oldest first.
    async fn all_records(&self) -> anyhow::Result<Vec<VerificationRecord>>;

    /// Delete one record. Returns `false` if it was already gone.
    async fn delete_record(&self, id: i64) -> anyhow::Result<bool>;
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending item was created.
    Inserted(i64),
    /// A live item for the same post and batch type existed; its error and
    /// attempt time were refreshed.
    Refreshed(i64),
}

impl EnqueueOutcome {
    pub fn id(&self) -> i64 {
        match self {
            EnqueueOutcome::Inserted(id) | EnqueueOutcome::Refreshed(id) => *id,
        }
    }
}

/// How a failed retry attempt should count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; back to pending until the retry budget is spent.
    Retryable,
    /// Will never succeed; dead-letter now.
    Permanent,
}

/// State of an item after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTransition {
    pub retry_count: i32,
    pub status: RetryStatus,
}

impl RetryTransition {
    /// Apply one failed attempt to an item that had `retry_count` failures.
    pub fn after_failure(retry_count: i32, kind: FailureKind, max_retry_count: i32) -> Self {
        let retry_count = retry_count.saturating_add(1);
        let status = match kind {
            FailureKind::Retryable if retry_count < max_retry_count => RetryStatus::Pending,
            _ => RetryStatus::Failed,
        };
        Self {
            retry_count,
            status,
        }
    }
}

/// Durable retry queue.
#[async_trait]
pub trait RetryQueueStore: Send + Sync {
    /// Insert a pending item, or refresh the live item for the same
    /// `(shortcode, batch_type)`. Check and insert must be atomic.
    async fn enqueue(&self, item: NewRetryItem) -> anyhow::Result<EnqueueOutcome>;

    /// Up to `limit` pending items, oldest first. Does not change status.
    async fn pending(&self, limit: i64) -> anyhow::Result<Vec<RetryQueueItem>>;

    /// Move a pending item to processing and stamp `last_attempt_at`.
    ///
    /// Returns `false` if the item was no longer pending.
    async fn mark_processing(&self, id: i64) -> anyhow::Result<bool>;

    async fn mark_completed(&self, id: i64) -> anyhow::Result<()>;

    /// Count one failed attempt and move the item to pending or failed
    /// according to [`RetryTransition::after_failure`].
    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        max_retry_count: i32,
    ) -> anyhow::Result<RetryTransition>;

    async fn stats(&self) -> anyhow::Result<QueueStats>;
}

/// Retry queue counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Everything a batch engine persists through, in one handle.
pub trait Store: RosterProvider + SubmissionProvider + VerificationStore + RetryQueueStore {}

impl<T> Store for T where T: RosterProvider + SubmissionProvider + VerificationStore + RetryQueueStore {}
