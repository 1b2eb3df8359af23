//! Retry queue manager.
//!
//! Lookups that fail with a retryable error are parked here and replayed by
//! the retry drain. Each item moves
//!
//! ```text
//! Pending ──► Processing ──┬─► Completed            (lookup + reconcile ok)
//!                          ├─► Pending (count + 1)  (retryable, budget left)
//!                          └─► Failed  (count + 1)  (budget spent, or the post is gone)
//! ```
//!
//! An item is marked `Processing` right before its lookup. A critical failure
//! aborts the drain and leaves that one item `Processing` for manual triage.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::classify::{truncate_message, ErrorClass};
use crate::error::RunError;
use crate::lookup::LookupSession;
use crate::reconcile;
use crate::store::{EnqueueOutcome, FailureKind, RetryQueueStore, RosterProvider, VerificationStore};
use crate::summary::{FailedLookup, RunSummary};
use crate::types::{BatchType, NewRetryItem, RetryQueueItem, RetryStatus, Roster};

/// Longest error message stored on a queue item.
pub const MAX_ERROR_CHARS: usize = 500;

/// What a drained item replays against.
pub struct DrainTarget<'a> {
    pub roster: &'a dyn RosterProvider,
    pub verifications: &'a dyn VerificationStore,
}

pub struct RetryQueueManager {
    store: Arc<dyn RetryQueueStore>,
    max_retry_count: i32,
}

impl RetryQueueManager {
    pub fn new(store: Arc<dyn RetryQueueStore>, max_retry_count: i32) -> Self {
        Self {
            store,
            max_retry_count,
        }
    }

    pub fn max_retry_count(&self) -> i32 {
        self.max_retry_count
    }

    /// Park a retryable failure. A live item for the same post and batch type
    /// is refreshed instead of duplicated.
    pub async fn enqueue(
        &self,
        link: &str,
        shortcode: &str,
        batch_type: BatchType,
        link_owner: Option<&str>,
        error: &str,
    ) -> anyhow::Result<EnqueueOutcome> {
        let outcome = self
            .store
            .enqueue(NewRetryItem {
                link: link.to_string(),
                shortcode: shortcode.to_string(),
                batch_type,
                link_owner: link_owner.map(str::to_string),
                error: truncate_message(error, MAX_ERROR_CHARS),
            })
            .await?;

        match outcome {
            EnqueueOutcome::Inserted(id) => {
                info!(id, shortcode, batch_type = %batch_type, "queued for retry")
            }
            EnqueueOutcome::Refreshed(id) => {
                debug!(id, shortcode, batch_type = %batch_type, "retry already queued, refreshed")
            }
        }
        Ok(outcome)
    }

    /// Up to `limit` pending items, oldest first. Warns about items left
    /// `Processing` by an earlier run.
    pub async fn next_batch(&self, limit: i64) -> anyhow::Result<Vec<RetryQueueItem>> {
        let stats = self.store.stats().await?;
        if stats.processing > 0 {
            warn!(
                processing = stats.processing,
                "retry items stuck in processing from an earlier run; they need manual triage"
            );
        }

        let batch = self.store.pending(limit).await?;
        info!(items = batch.len(), pending = stats.pending, failed = stats.failed, "draining retry queue");
        Ok(batch)
    }

    /// Replay `batch` through `session`.
    ///
    /// Returns early with [`RunError::Critical`] on the first critical lookup
    /// failure; everything committed before it stays committed.
    pub async fn drain_batch(
        &self,
        batch: Vec<RetryQueueItem>,
        session: &mut dyn LookupSession,
        target: &DrainTarget<'_>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        summary.total = batch.len();

        let roster = if batch.iter().any(|item| item.batch_type == BatchType::Verify) {
            target.roster.roster().await?
        } else {
            Roster::default()
        };

        for item in batch {
            if !self.store.mark_processing(item.id).await? {
                debug!(id = item.id, "retry item no longer pending, skipping");
                continue;
            }
            info!(
                id = item.id,
                shortcode = %item.shortcode,
                batch_type = %item.batch_type,
                attempt = item.retry_count + 1,
                "retrying lookup"
            );

            match session.lookup(&item.shortcode).await {
                Ok(snapshot) => {
                    match item.batch_type {
                        BatchType::Verify => {
                            let Some(owner) = item.link_owner.as_deref() else {
                                self.fail(&item, "verify retry item has no link owner", FailureKind::Permanent, summary)
                                    .await?;
                                continue;
                            };
                            let added =
                                reconcile::verify(target.verifications, &snapshot, &item.link, owner, &roster)
                                    .await?;
                            summary.added += added.len();
                            info!(id = item.id, added = added.len(), "verify retry reconciled");
                        }
                        BatchType::Cleanup => {
                            let existing = target.verifications.records_for_link(&item.link).await?;
                            let removed =
                                reconcile::cleanup(target.verifications, &snapshot, &existing).await?;
                            summary.removed += removed.len();
                            summary.kept += existing.len() - removed.len();
                            info!(id = item.id, removed = removed.len(), "cleanup retry reconciled");
                        }
                    }
                    self.store.mark_completed(item.id).await?;
                    summary.checked += 1;
                }
                Err(err) if err.class.is_critical() => {
                    error!(
                        account = session.account(),
                        shortcode = %item.shortcode,
                        error = %err.message,
                        "helper account blocked, aborting retry drain"
                    );
                    return Err(RunError::Critical {
                        account: session.account().to_string(),
                        shortcode: item.shortcode.clone(),
                        message: err.message,
                    });
                }
                Err(err) => {
                    let kind = if err.class.is_retryable() {
                        FailureKind::Retryable
                    } else {
                        if err.class == ErrorClass::Unknown {
                            error!(shortcode = %item.shortcode, error = %err.message, "unclassified lookup failure, dead-lettering");
                        }
                        summary.failures.push(FailedLookup {
                            owner: item.link_owner.clone(),
                            shortcode: item.shortcode.clone(),
                            class: err.class,
                            error: truncate_message(&err.message, MAX_ERROR_CHARS),
                        });
                        FailureKind::Permanent
                    };
                    self.fail(&item, &err.message, kind, summary).await?;
                }
            }
        }

        Ok(())
    }

    async fn fail(
        &self,
        item: &RetryQueueItem,
        error: &str,
        kind: FailureKind,
        summary: &mut RunSummary,
    ) -> anyhow::Result<()> {
        let transition = self
            .store
            .record_failure(
                item.id,
                &truncate_message(error, MAX_ERROR_CHARS),
                kind,
                self.max_retry_count,
            )
            .await?;

        if transition.status == RetryStatus::Failed {
            summary.dead_lettered += 1;
            warn!(
                id = item.id,
                shortcode = %item.shortcode,
                retry_count = transition.retry_count,
                "retry item dead-lettered"
            );
        } else {
            summary.retry_failed += 1;
            warn!(
                id = item.id,
                shortcode = %item.shortcode,
                retry_count = transition.retry_count,
                max = self.max_retry_count,
                "retry failed, back to pending"
            );
        }
        Ok(())
    }
}
