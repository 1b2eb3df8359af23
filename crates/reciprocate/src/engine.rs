//! Batch orchestrators.
//!
//! An [`Engine`] runs one of the three scheduled jobs to completion:
//!
//! - **verify**: every submission of the current week is looked up and its
//!   non-reciprocators recorded.
//! - **cleanup**: every recorded non-reciprocation is re-checked, one lookup
//!   per distinct link, and cleared once the participant caught up.
//! - **retry drain**: a bounded batch of queued lookups is replayed.
//!
//! Each run acquires exactly one lookup session and processes its work set
//! strictly in order. A critical lookup failure aborts the whole run because
//! the helper account is presumed compromised. Writes are committed per item,
//! so an abort keeps the progress made before it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, info_span, warn, Instrument};

use crate::classify::{truncate_message, ClassifiedError, ErrorClass};
use crate::config::RunConfig;
use crate::error::RunError;
use crate::lookup::{LookupSession, PacedSession, SessionProvider};
use crate::post::{extract_shortcode, week_start};
use crate::queue::{DrainTarget, RetryQueueManager, MAX_ERROR_CHARS};
use crate::reconcile;
use crate::store::{
    RetryQueueStore, RosterProvider, Store, SubmissionProvider, VerificationStore,
};
use crate::summary::{FailedLookup, JobKind, NoOpNotifier, Notifier, RunSummary};
use crate::types::{BatchType, VerificationRecord};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    roster: Arc<dyn RosterProvider>,
    submissions: Arc<dyn SubmissionProvider>,
    verifications: Arc<dyn VerificationStore>,
    queue: Arc<dyn RetryQueueStore>,
    sessions: Arc<dyn SessionProvider>,
    notifier: Arc<dyn Notifier>,
    config: RunConfig,
}

impl EngineBuilder {
    /// Use `store` for every persistence port and `sessions` for lookups.
    pub fn new<S>(store: Arc<S>, sessions: Arc<dyn SessionProvider>) -> Self
    where
        S: Store + 'static,
    {
        Self {
            roster: store.clone(),
            submissions: store.clone(),
            verifications: store.clone(),
            queue: store,
            sessions,
            notifier: Arc::new(NoOpNotifier),
            config: RunConfig::default(),
        }
    }

    pub fn with_roster(mut self, roster: Arc<dyn RosterProvider>) -> Self {
        self.roster = roster;
        self
    }

    pub fn with_submissions(mut self, submissions: Arc<dyn SubmissionProvider>) -> Self {
        self.submissions = submissions;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let retry_queue = RetryQueueManager::new(self.queue, self.config.max_retry_count);
        Engine {
            roster: self.roster,
            submissions: self.submissions,
            verifications: self.verifications,
            retry_queue,
            sessions: self.sessions,
            notifier: self.notifier,
            config: self.config,
        }
    }
}

/// Runs the verify, cleanup and retry-drain jobs.
pub struct Engine {
    roster: Arc<dyn RosterProvider>,
    submissions: Arc<dyn SubmissionProvider>,
    verifications: Arc<dyn VerificationStore>,
    retry_queue: RetryQueueManager,
    sessions: Arc<dyn SessionProvider>,
    notifier: Arc<dyn Notifier>,
    config: RunConfig,
}

impl Engine {
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn retry_queue(&self) -> &RetryQueueManager {
        &self.retry_queue
    }

    /// Run `job` to completion and notify with its summary.
    pub async fn run(&self, job: JobKind) -> Result<RunSummary, RunError> {
        let week = match job {
            JobKind::Verify => Some(week_start(Utc::now(), self.config.week_offset())),
            JobKind::Cleanup | JobKind::RetryDrain => None,
        };
        self.run_inner(job, week).await
    }

    pub async fn run_verify(&self) -> Result<RunSummary, RunError> {
        self.run(JobKind::Verify).await
    }

    /// Verify the submissions of an explicit week.
    pub async fn run_verify_for_week(&self, week: NaiveDate) -> Result<RunSummary, RunError> {
        self.run_inner(JobKind::Verify, Some(week)).await
    }

    pub async fn run_cleanup(&self) -> Result<RunSummary, RunError> {
        self.run(JobKind::Cleanup).await
    }

    pub async fn run_retry_drain(&self) -> Result<RunSummary, RunError> {
        self.run(JobKind::RetryDrain).await
    }

    async fn run_inner(&self, job: JobKind, week: Option<NaiveDate>) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::new(job);
        summary.week = week;

        let span = info_span!("batch_run", job = %job, run_id = %summary.run_id);
        let result = self
            .execute(job, &mut summary)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match &result {
            Ok(()) => info!(
                checked = summary.checked,
                added = summary.added,
                removed = summary.removed,
                failed = summary.failed(),
                "batch run finished"
            ),
            Err(err) => {
                summary.critical_abort = err.is_critical();
                summary.error = Some(err.to_string());
                error!(error = %err, critical = summary.critical_abort, "batch run aborted");
            }
        });

        self.notifier.notify(&summary).await;
        result.map(|()| summary)
    }

    async fn execute(&self, job: JobKind, summary: &mut RunSummary) -> Result<(), RunError> {
        match job {
            JobKind::Verify => {
                let week = summary
                    .week
                    .unwrap_or_else(|| week_start(Utc::now(), self.config.week_offset()));
                self.verify_run(week, summary).await
            }
            JobKind::Cleanup => self.cleanup_run(summary).await,
            JobKind::RetryDrain => self.retry_drain_run(summary).await,
        }
    }

    async fn open_session(&self, summary: &mut RunSummary) -> Result<PacedSession, RunError> {
        let session = self
            .sessions
            .acquire()
            .await
            .map_err(|e| RunError::SessionUnavailable(format!("{e:#}")))?;
        info!(account = session.account(), "lookup session acquired");
        summary.account = Some(session.account().to_string());
        Ok(PacedSession::new(session, self.config.pacing.clone()))
    }

    async fn verify_run(&self, week: NaiveDate, summary: &mut RunSummary) -> Result<(), RunError> {
        let submissions = self.submissions.submissions_for_week(week).await?;
        summary.total = submissions.len();
        info!(%week, links = submissions.len(), "verifying weekly submissions");
        if submissions.is_empty() {
            warn!(%week, "no submissions to verify");
            return Ok(());
        }

        let roster = self.roster.roster().await?;
        info!(participants = roster.len(), "roster loaded");

        let mut session = self.open_session(summary).await?;

        for submission in &submissions {
            let Some(shortcode) = extract_shortcode(&submission.link) else {
                warn!(owner = %submission.owner, link = %submission.link, "no post key in link, skipping");
                summary.invalid_links += 1;
                continue;
            };
            info!(owner = %submission.owner, %shortcode, "checking submission");

            match session.lookup(&shortcode).await {
                Ok(snapshot) => {
                    let added = reconcile::verify(
                        self.verifications.as_ref(),
                        &snapshot,
                        &submission.link,
                        &submission.owner,
                        &roster,
                    )
                    .await?;
                    summary.checked += 1;
                    summary.added += added.len();
                    info!(
                        %shortcode,
                        commenters = snapshot.commenters().len(),
                        likers = snapshot.likers().len(),
                        added = added.len(),
                        "submission verified"
                    );
                }
                Err(err) => {
                    self.handle_failure(
                        &session,
                        err,
                        &submission.link,
                        &shortcode,
                        BatchType::Verify,
                        Some(&submission.owner),
                        summary,
                    )
                    .await?;
                }
            }
        }

        Ok(())
    }

    async fn cleanup_run(&self, summary: &mut RunSummary) -> Result<(), RunError> {
        let records = self.verifications.all_records().await?;
        summary.total = records.len();
        if records.is_empty() {
            info!("no verification records to re-check");
            return Ok(());
        }

        let by_link = group_by_link(records);
        info!(records = summary.total, links = by_link.len(), "re-checking verification records");

        let mut session = self.open_session(summary).await?;

        for (link, records) in &by_link {
            let Some(shortcode) = extract_shortcode(link) else {
                warn!(%link, records = records.len(), "no post key in link, keeping records");
                summary.invalid_links += 1;
                summary.kept += records.len();
                continue;
            };

            match session.lookup(&shortcode).await {
                Ok(snapshot) => {
                    let removed =
                        reconcile::cleanup(self.verifications.as_ref(), &snapshot, records).await?;
                    summary.checked += 1;
                    summary.removed += removed.len();
                    summary.kept += records.len() - removed.len();
                    info!(%shortcode, removed = removed.len(), kept = records.len() - removed.len(), "link re-checked");
                }
                Err(err) => {
                    summary.kept += records.len();
                    let owner = records.first().map(|r| r.link_owner.as_str());
                    self.handle_failure(&session, err, link, &shortcode, BatchType::Cleanup, owner, summary)
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn retry_drain_run(&self, summary: &mut RunSummary) -> Result<(), RunError> {
        let batch = self.retry_queue.next_batch(self.config.drain_batch_size).await?;
        if batch.is_empty() {
            info!("retry queue is empty");
            return Ok(());
        }

        let mut session = self.open_session(summary).await?;
        let target = DrainTarget {
            roster: self.roster.as_ref(),
            verifications: self.verifications.as_ref(),
        };
        self.retry_queue
            .drain_batch(batch, &mut session, &target, summary)
            .await
    }

    /// React to an already-classified lookup failure.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        session: &dyn LookupSession,
        err: ClassifiedError,
        link: &str,
        shortcode: &str,
        batch_type: BatchType,
        owner: Option<&str>,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        match err.class {
            ErrorClass::Critical => {
                error!(
                    account = session.account(),
                    shortcode,
                    error = %err.message,
                    "helper account blocked, aborting run"
                );
                Err(RunError::Critical {
                    account: session.account().to_string(),
                    shortcode: shortcode.to_string(),
                    message: err.message,
                })
            }
            ErrorClass::Retryable => {
                warn!(shortcode, error = %err.message, "transient lookup failure, queueing retry");
                self.retry_queue
                    .enqueue(link, shortcode, batch_type, owner, &err.message)
                    .await?;
                summary.queued += 1;
                Ok(())
            }
            ErrorClass::Skip | ErrorClass::Unknown => {
                if err.class == ErrorClass::Unknown {
                    error!(shortcode, error = %err.message, "unclassified lookup failure, skipping");
                } else {
                    info!(shortcode, error = %err.message, "post unreachable, skipping");
                }
                summary.skipped += 1;
                summary.failures.push(FailedLookup {
                    owner: owner.map(str::to_string),
                    shortcode: shortcode.to_string(),
                    class: err.class,
                    error: truncate_message(&err.message, MAX_ERROR_CHARS),
                });
                Ok(())
            }
        }
    }
}

/// Records grouped by link, links in first-seen order of the oldest record.
fn group_by_link(records: Vec<VerificationRecord>) -> Vec<(String, Vec<VerificationRecord>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<VerificationRecord>> = BTreeMap::new();
    for record in records {
        if !groups.contains_key(&record.link) {
            order.push(record.link.clone());
        }
        groups.entry(record.link.clone()).or_default().push(record);
    }
    order
        .into_iter()
        .filter_map(|link| groups.remove(&link).map(|records| (link, records)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::{InteractionSnapshot, RetryStatus, Submission};

    type Outcome = Result<InteractionSnapshot, ClassifiedError>;
    type Script = Arc<Mutex<HashMap<String, VecDeque<Outcome>>>>;

    struct Sessions {
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
        available: bool,
    }

    struct Session {
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SessionProvider for Sessions {
        async fn acquire(&self) -> anyhow::Result<Box<dyn LookupSession>> {
            if !self.available {
                anyhow::bail!("no active helper account");
            }
            Ok(Box::new(Session {
                script: self.script.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    #[async_trait]
    impl LookupSession for Session {
        fn account(&self) -> &str {
            "helper01"
        }

        async fn lookup(&mut self, shortcode: &str) -> Outcome {
            self.calls.lock().unwrap().push(shortcode.to_string());
            self.script
                .lock()
                .unwrap()
                .get_mut(shortcode)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(ClassifiedError::skip("not found")))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Engine,
        script: Script,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new(available: bool) -> Self {
            let store = Arc::new(MemoryStore::new().with_roster(["a", "b", "c", "owner", "owner2"]));
            let script: Script = Arc::default();
            let calls = Arc::new(Mutex::new(Vec::new()));
            let sessions = Arc::new(Sessions {
                script: script.clone(),
                calls: calls.clone(),
                available,
            });
            let engine = EngineBuilder::new(store.clone(), sessions)
                .with_config(RunConfig::without_pacing())
                .build();
            Self {
                store,
                engine,
                script,
                calls,
            }
        }

        fn on(&self, shortcode: &str, outcome: Outcome) {
            self.script
                .lock()
                .unwrap()
                .entry(shortcode.to_string())
                .or_default()
                .push_back(outcome);
        }

        fn submit(&self, owner: &str, code: &str) {
            self.store.add_submission(Submission {
                owner: owner.into(),
                link: link(code),
                week: week(),
            });
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 12).unwrap()
    }

    fn link(code: &str) -> String {
        format!("https://www.instagram.com/p/{code}/")
    }

    fn snap(commenters: &[&str], likers: &[&str]) -> Outcome {
        Ok(InteractionSnapshot::new(commenters, likers))
    }

    #[tokio::test]
    async fn verify_run_records_queues_and_skips() {
        let h = Harness::new(true);
        h.submit("owner", "P1");
        h.submit("owner2", "P2");
        h.submit("a", "P3");
        h.on("P1", snap(&["a"], &["b"]));
        h.on("P2", Err(ClassifiedError::retryable("HTTP 429")));
        h.on("P3", Err(ClassifiedError::skip("Post deleted")));

        let summary = h.engine.run_verify_for_week(week()).await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.added, 2); // c and owner2
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.account.as_deref(), Some("helper01"));

        let items = h.store.retry_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].shortcode, "P2");
        assert_eq!(items[0].batch_type, BatchType::Verify);
        assert_eq!(items[0].link_owner.as_deref(), Some("owner2"));
        assert_eq!(items[0].status, RetryStatus::Pending);
    }

    #[tokio::test]
    async fn verify_run_skips_links_without_post_key() {
        let h = Harness::new(true);
        h.store.add_submission(Submission {
            owner: "owner".into(),
            link: "https://www.instagram.com/owner/".into(),
            week: week(),
        });

        let summary = h.engine.run_verify_for_week(week()).await.unwrap();
        assert_eq!(summary.invalid_links, 1);
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn critical_failure_aborts_verify_and_keeps_earlier_work() {
        let h = Harness::new(true);
        h.submit("owner", "P1");
        h.submit("owner2", "P2");
        h.submit("a", "P3");
        h.on("P1", snap(&[], &[]));
        h.on("P2", Err(ClassifiedError::critical("feedback_required")));

        let err = h.engine.run_verify_for_week(week()).await.unwrap_err();

        assert!(err.is_critical());
        assert_eq!(h.calls(), vec!["P1", "P2"]);
        assert_eq!(h.store.records_for_link(&link("P1")).await.unwrap().len(), 4);
        assert!(h.store.retry_items().is_empty());
    }

    #[tokio::test]
    async fn empty_week_does_not_open_a_session() {
        let h = Harness::new(false);
        let summary = h.engine.run_verify_for_week(week()).await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.account.is_none());
    }

    #[tokio::test]
    async fn missing_session_fails_the_run() {
        let h = Harness::new(false);
        h.submit("owner", "P1");
        let err = h.engine.run_verify_for_week(week()).await.unwrap_err();
        assert!(matches!(err, RunError::SessionUnavailable(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn cleanup_run_looks_up_each_link_once() {
        let h = Harness::new(true);
        h.submit("owner", "P1");
        h.submit("owner2", "P2");
        h.on("P1", snap(&[], &[]));
        h.on("P2", snap(&["a", "b", "c"], &[]));
        h.engine.run_verify_for_week(week()).await.unwrap();
        // P1: a, b, c, owner2. P2: owner.
        assert_eq!(h.store.all_records().await.unwrap().len(), 5);

        h.on("P1", snap(&["a"], &["owner2"]));
        h.on("P2", Err(ClassifiedError::retryable("Something went wrong")));
        let summary = h.engine.run_cleanup().await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.removed, 2);
        assert_eq!(summary.kept, 3);
        assert_eq!(summary.queued, 1);
        assert_eq!(h.calls(), vec!["P1", "P2", "P1", "P2"]);

        let items = h.store.retry_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].batch_type, BatchType::Cleanup);
        assert_eq!(items[0].link_owner.as_deref(), Some("owner2"));
    }

    #[tokio::test]
    async fn critical_failure_aborts_cleanup_and_keeps_earlier_deletions() {
        let h = Harness::new(true);
        h.submit("owner", "P1");
        h.submit("owner2", "P2");
        h.submit("a", "P3");
        for code in ["P1", "P2", "P3"] {
            h.on(code, snap(&[], &[]));
        }
        h.engine.run_verify_for_week(week()).await.unwrap();
        assert_eq!(h.store.all_records().await.unwrap().len(), 12);

        h.on("P1", snap(&["a", "b", "c"], &["owner2"]));
        h.on("P2", Err(ClassifiedError::critical("checkpoint_required")));
        let err = h.engine.run_cleanup().await.unwrap_err();

        assert!(matches!(&err, RunError::Critical { shortcode, .. } if shortcode == "P2"));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(h.calls()[3..].to_vec(), vec!["P1", "P2"]);
        assert!(h.store.records_for_link(&link("P1")).await.unwrap().is_empty());
        assert_eq!(h.store.records_for_link(&link("P2")).await.unwrap().len(), 4);
        assert_eq!(h.store.records_for_link(&link("P3")).await.unwrap().len(), 4);
        assert!(h.store.retry_items().is_empty());
    }

    #[tokio::test]
    async fn empty_retry_queue_does_not_open_a_session() {
        let h = Harness::new(false);
        let summary = h.engine.run_retry_drain().await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.account.is_none());
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn retry_drain_replays_queued_verify() {
        let h = Harness::new(true);
        h.submit("owner", "P1");
        h.on("P1", Err(ClassifiedError::retryable("HTTP 429")));
        h.engine.run_verify_for_week(week()).await.unwrap();

        h.on("P1", snap(&["a", "b", "c"], &[]));
        let summary = h.engine.run_retry_drain().await.unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.added, 1); // owner2
        assert_eq!(h.store.retry_items()[0].status, RetryStatus::Completed);
    }

    #[test]
    fn grouping_keeps_first_seen_link_order() {
        let record = |id, link: &str| VerificationRecord {
            id,
            participant: format!("p{id}"),
            link: link.to_string(),
            link_owner: "o".into(),
            created_at: Utc::now(),
        };
        let groups = group_by_link(vec![record(1, "z"), record(2, "a"), record(3, "z")]);
        let links: Vec<_> = groups.iter().map(|(l, r)| (l.as_str(), r.len())).collect();
        assert_eq!(links, vec![("z", 2), ("a", 1)]);
    }
}
