//! In-memory store for dry runs and tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::{
    EnqueueOutcome, FailureKind, QueueStats, RetryQueueStore, RetryTransition, RosterProvider,
    SubmissionProvider, VerificationStore,
};
use crate::types::{
    BatchType, NewRetryItem, NewVerification, RetryQueueItem, RetryStatus, Roster, Submission,
    VerificationRecord,
};

/// Implements every persistence port in process memory.
///
/// Uniqueness follows the database: one record per `(participant, link)` and
/// one live retry item per `(shortcode, batch_type)`, both enforced through
/// map entries so check and insert cannot interleave.
#[derive(Default)]
pub struct MemoryStore {
    roster: RwLock<Vec<String>>,
    submissions: RwLock<Vec<Submission>>,
    records: DashMap<(String, String), VerificationRecord>,
    queue: DashMap<i64, RetryQueueItem>,
    live: DashMap<(String, BatchType), i64>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roster<I, S>(self, usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_roster(usernames);
        self
    }

    pub fn set_roster<I, S>(&self, usernames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut roster = self.roster.write().unwrap_or_else(PoisonError::into_inner);
        *roster = usernames.into_iter().map(Into::into).collect();
    }

    pub fn add_submission(&self, submission: Submission) {
        self.submissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(submission);
    }

    /// Snapshot of one retry item.
    pub fn retry_item(&self, id: i64) -> Option<RetryQueueItem> {
        self.queue.get(&id).map(|item| item.clone())
    }

    /// Every retry item, oldest first.
    pub fn retry_items(&self) -> Vec<RetryQueueItem> {
        let mut items: Vec<_> = self.queue.iter().map(|item| item.clone()).collect();
        items.sort_by_key(|item| (item.created_at, item.id));
        items
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sorted_records<F>(&self, keep: F) -> Vec<VerificationRecord>
    where
        F: Fn(&VerificationRecord) -> bool,
    {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }
}

#[async_trait]
impl RosterProvider for MemoryStore {
    async fn roster(&self) -> anyhow::Result<Roster> {
        let roster = self.roster.read().unwrap_or_else(PoisonError::into_inner);
        Ok(Roster::new(roster.iter()))
    }
}

#[async_trait]
impl SubmissionProvider for MemoryStore {
    async fn submissions_for_week(&self, week: NaiveDate) -> anyhow::Result<Vec<Submission>> {
        let submissions = self.submissions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(submissions.iter().filter(|s| s.week == week).cloned().collect())
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        record: NewVerification,
    ) -> anyhow::Result<Option<VerificationRecord>> {
        let key = (record.participant.clone(), record.link.clone());
        match self.records.entry(key) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let stored = VerificationRecord {
                    id: self.next_id(),
                    participant: record.participant,
                    link: record.link,
                    link_owner: record.link_owner,
                    created_at: Utc::now(),
                };
                slot.insert(stored.clone());
                Ok(Some(stored))
            }
        }
    }

    async fn records_for_link(&self, link: &str) -> anyhow::Result<Vec<VerificationRecord>> {
        Ok(self.sorted_records(|record| record.link == link))
    }

    async fn all_records(&self) -> anyhow::Result<Vec<VerificationRecord>> {
        Ok(self.sorted_records(|_| true))
    }

    async fn delete_record(&self, id: i64) -> anyhow::Result<bool> {
        let key = self
            .records
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.key().clone());

        Ok(match key {
            Some(key) => self.records.remove(&key).is_some(),
            None => false,
        })
    }
}

#[async_trait]
impl RetryQueueStore for MemoryStore {
    async fn enqueue(&self, item: NewRetryItem) -> anyhow::Result<EnqueueOutcome> {
        let now = Utc::now();
        match self.live.entry((item.shortcode.clone(), item.batch_type)) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                if let Some(mut live) = self.queue.get_mut(&id) {
                    live.last_error = Some(item.error);
                    live.last_attempt_at = Some(now);
                }
                Ok(EnqueueOutcome::Refreshed(id))
            }
            Entry::Vacant(slot) => {
                let id = self.next_id();
                self.queue.insert(
                    id,
                    RetryQueueItem {
                        id,
                        link: item.link,
                        shortcode: item.shortcode,
                        batch_type: item.batch_type,
                        link_owner: item.link_owner,
                        retry_count: 0,
                        last_error: Some(item.error),
                        last_attempt_at: Some(now),
                        status: RetryStatus::Pending,
                        created_at: now,
                    },
                );
                slot.insert(id);
                Ok(EnqueueOutcome::Inserted(id))
            }
        }
    }

    async fn pending(&self, limit: i64) -> anyhow::Result<Vec<RetryQueueItem>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .retry_items()
            .into_iter()
            .filter(|item| item.status == RetryStatus::Pending)
            .take(limit)
            .collect())
    }

    async fn mark_processing(&self, id: i64) -> anyhow::Result<bool> {
        let Some(mut item) = self.queue.get_mut(&id) else {
            return Ok(false);
        };
        if item.status != RetryStatus::Pending {
            return Ok(false);
        }
        item.status = RetryStatus::Processing;
        item.last_attempt_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_completed(&self, id: i64) -> anyhow::Result<()> {
        let key = {
            let mut item = self
                .queue
                .get_mut(&id)
                .ok_or_else(|| anyhow!("retry item {id} not found"))?;
            item.status = RetryStatus::Completed;
            (item.shortcode.clone(), item.batch_type)
        };
        self.live.remove_if(&key, |_, live_id| *live_id == id);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        max_retry_count: i32,
    ) -> anyhow::Result<RetryTransition> {
        let (transition, key) = {
            let mut item = self
                .queue
                .get_mut(&id)
                .ok_or_else(|| anyhow!("retry item {id} not found"))?;
            let transition = RetryTransition::after_failure(item.retry_count, kind, max_retry_count);
            item.retry_count = transition.retry_count;
            item.status = transition.status;
            item.last_error = Some(error.to_string());
            (transition, (item.shortcode.clone(), item.batch_type))
        };

        if !transition.status.is_live() {
            self.live.remove_if(&key, |_, live_id| *live_id == id);
        }
        Ok(transition)
    }

    async fn stats(&self) -> anyhow::Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.queue.iter() {
            match item.status {
                RetryStatus::Pending => stats.pending += 1,
                RetryStatus::Processing => stats.processing += 1,
                RetryStatus::Completed => stats.completed += 1,
                RetryStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(shortcode: &str, batch_type: BatchType, error: &str) -> NewRetryItem {
        NewRetryItem {
            link: format!("https://www.instagram.com/p/{shortcode}/"),
            shortcode: shortcode.to_string(),
            batch_type,
            link_owner: Some("owner".into()),
            error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn one_live_item_per_post_and_batch_type() {
        let store = MemoryStore::new();

        let first = store.enqueue(retry("ABC", BatchType::Verify, "429")).await.unwrap();
        let again = store
            .enqueue(retry("ABC", BatchType::Verify, "something went wrong"))
            .await
            .unwrap();
        let cleanup = store.enqueue(retry("ABC", BatchType::Cleanup, "429")).await.unwrap();

        assert!(matches!(first, EnqueueOutcome::Inserted(_)));
        assert_eq!(again, EnqueueOutcome::Refreshed(first.id()));
        assert!(matches!(cleanup, EnqueueOutcome::Inserted(_)));
        assert_ne!(cleanup.id(), first.id());

        let item = store.retry_item(first.id()).unwrap();
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.last_error.as_deref(), Some("something went wrong"));
    }

    #[tokio::test]
    async fn finished_items_free_the_slot() {
        let store = MemoryStore::new();
        let first = store.enqueue(retry("ABC", BatchType::Verify, "429")).await.unwrap();
        assert!(store.mark_processing(first.id()).await.unwrap());

        // Processing still counts as live.
        let refreshed = store.enqueue(retry("ABC", BatchType::Verify, "429")).await.unwrap();
        assert_eq!(refreshed, EnqueueOutcome::Refreshed(first.id()));

        store.mark_completed(first.id()).await.unwrap();
        let next = store.enqueue(retry("ABC", BatchType::Verify, "429")).await.unwrap();
        assert!(matches!(next, EnqueueOutcome::Inserted(id) if id != first.id()));
        assert_eq!(store.retry_items().len(), 2);
    }

    #[tokio::test]
    async fn mark_processing_only_claims_pending_items() {
        let store = MemoryStore::new();
        let id = store.enqueue(retry("ABC", BatchType::Verify, "429")).await.unwrap().id();

        assert!(store.mark_processing(id).await.unwrap());
        assert!(!store.mark_processing(id).await.unwrap());
        assert!(!store.mark_processing(999).await.unwrap());
        assert!(store.retry_item(id).unwrap().last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn failures_dead_letter_at_the_bound() {
        let store = MemoryStore::new();
        let id = store.enqueue(retry("ABC", BatchType::Verify, "429")).await.unwrap().id();

        for attempt in 1..=3 {
            store.mark_processing(id).await.unwrap();
            let t = store
                .record_failure(id, "429", FailureKind::Retryable, 3)
                .await
                .unwrap();
            assert_eq!(t.retry_count, attempt);
        }

        let item = store.retry_item(id).unwrap();
        assert_eq!(item.status, RetryStatus::Failed);
        assert!(store.pending(10).await.unwrap().is_empty());
        assert_eq!(
            store.stats().await.unwrap(),
            QueueStats {
                failed: 1,
                ..QueueStats::default()
            }
        );
    }

    #[tokio::test]
    async fn pending_is_oldest_first_and_bounded() {
        let store = MemoryStore::new();
        for code in ["A", "B", "C"] {
            store.enqueue(retry(code, BatchType::Verify, "429")).await.unwrap();
        }

        let batch = store.pending(2).await.unwrap();
        let codes: Vec<_> = batch.iter().map(|i| i.shortcode.as_str()).collect();
        assert_eq!(codes, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn record_pairs_are_unique() {
        let store = MemoryStore::new();
        let record = NewVerification {
            participant: "a".into(),
            link: "L".into(),
            link_owner: "o".into(),
        };

        assert!(store.insert_if_absent(record.clone()).await.unwrap().is_some());
        assert!(store.insert_if_absent(record).await.unwrap().is_none());
        assert_eq!(store.all_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = MemoryStore::new();
        let stored = store
            .insert_if_absent(NewVerification {
                participant: "a".into(),
                link: "L".into(),
                link_owner: "o".into(),
            })
            .await
            .unwrap()
            .unwrap();

        assert!(store.delete_record(stored.id).await.unwrap());
        assert!(!store.delete_record(stored.id).await.unwrap());
    }

    #[tokio::test]
    async fn roster_and_submissions_round_through_providers() {
        let store = MemoryStore::new().with_roster(["Alice", "bob"]);
        let week = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap();
        store.add_submission(Submission {
            owner: "alice".into(),
            link: "L1".into(),
            week,
        });
        store.add_submission(Submission {
            owner: "bob".into(),
            link: "L0".into(),
            week: week - chrono::Days::new(7),
        });

        assert!(store.roster().await.unwrap().contains("alice"));
        let this_week = store.submissions_for_week(week).await.unwrap();
        assert_eq!(this_week.len(), 1);
        assert_eq!(this_week[0].link, "L1");
    }

    #[tokio::test]
    async fn writes_survive_a_poisoned_lock() {
        let store = MemoryStore::new().with_roster(["alice"]);
        let week = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap();
        let panicked = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _roster = store.roster.write().unwrap();
                    let _submissions = store.submissions.write().unwrap();
                    panic!("writer died holding the locks");
                })
                .join()
                .is_err()
        });
        assert!(panicked);
        assert!(store.roster.is_poisoned());

        store.set_roster(["bob"]);
        store.add_submission(Submission {
            owner: "bob".into(),
            link: "L1".into(),
            week,
        });

        let roster = store.roster().await.unwrap();
        assert!(roster.contains("bob"));
        assert!(!roster.contains("alice"));
        assert_eq!(store.submissions_for_week(week).await.unwrap().len(), 1);
    }
}
