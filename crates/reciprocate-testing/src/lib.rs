//! Testing utilities for reciprocate batch runs.
//!
//! - [`ScriptedSessions`]: a [`SessionProvider`] whose sessions answer from
//!   per-shortcode queues of canned outcomes and log every lookup.
//! - [`RecordingNotifier`]: keeps every summary it is handed.
//! - [`TestBed`]: a [`MemoryStore`], scripted sessions and a recording
//!   notifier wired into an [`Engine`] with pacing disabled.
//!
//! # Example
//!
//! ```rust,ignore
//! use reciprocate_testing::{post_link, snapshot, TestBed};
//!
//! let bed = TestBed::new(["alice", "bob"]);
//! bed.submit("alice", "P1");
//! bed.sessions.on("P1", snapshot(&["bob"], &[]));
//!
//! let summary = bed.engine.run_verify_for_week(bed.week).await?;
//! assert_eq!(summary.added, 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use reciprocate_core::{
    ClassifiedError, Engine, EngineBuilder, InteractionSnapshot, LookupSession, MemoryStore,
    Notifier, RunConfig, RunSummary, SessionProvider, Submission,
};

/// Outcome of one scripted lookup.
pub type Outcome = Result<InteractionSnapshot, ClassifiedError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, VecDeque<Outcome>>,
    fallback: Option<Outcome>,
    calls: Vec<String>,
    opened: usize,
}

/// Session provider driven by a script shared with its sessions.
///
/// Each shortcode answers from its own queue, front first. A shortcode with
/// an empty queue answers with the fallback, which defaults to a Skip
/// ("post not found").
#[derive(Clone)]
pub struct ScriptedSessions {
    account: String,
    available: bool,
    script: Arc<Mutex<Script>>,
}

impl ScriptedSessions {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            available: true,
            script: Arc::default(),
        }
    }

    /// Make `acquire` fail as if no helper account were usable.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Queue `outcome` for the next lookup of `shortcode`.
    pub fn on(&self, shortcode: &str, outcome: Outcome) -> &Self {
        lock(&self.script)
            .responses
            .entry(shortcode.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    /// Queue the same outcome `times` times.
    pub fn on_repeated(&self, shortcode: &str, outcome: Outcome, times: usize) -> &Self {
        for _ in 0..times {
            self.on(shortcode, outcome.clone());
        }
        self
    }

    /// Answer unscripted lookups with `outcome`.
    pub fn otherwise(&self, outcome: Outcome) -> &Self {
        lock(&self.script).fallback = Some(outcome);
        self
    }

    /// Every shortcode looked up, in order, across all sessions.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }

    /// How many sessions were handed out.
    pub fn sessions_opened(&self) -> usize {
        lock(&self.script).opened
    }
}

#[async_trait]
impl SessionProvider for ScriptedSessions {
    async fn acquire(&self) -> anyhow::Result<Box<dyn LookupSession>> {
        if !self.available {
            anyhow::bail!("no active helper account");
        }
        lock(&self.script).opened += 1;
        Ok(Box::new(ScriptedSession {
            account: self.account.clone(),
            script: self.script.clone(),
        }))
    }
}

/// One session handed out by [`ScriptedSessions`].
pub struct ScriptedSession {
    account: String,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl LookupSession for ScriptedSession {
    fn account(&self) -> &str {
        &self.account
    }

    async fn lookup(&mut self, shortcode: &str) -> Outcome {
        let mut script = lock(&self.script);
        script.calls.push(shortcode.to_string());
        let scripted = script
            .responses
            .get_mut(shortcode)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| script.fallback.clone())
            .unwrap_or_else(|| Err(ClassifiedError::skip("Post not found")))
    }
}

/// Keeps every summary it is handed.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    summaries: Arc<Mutex<Vec<RunSummary>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        lock(&self.summaries).clone()
    }

    pub fn last(&self) -> Option<RunSummary> {
        lock(&self.summaries).last().cloned()
    }

    pub fn count(&self) -> usize {
        lock(&self.summaries).len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, summary: &RunSummary) {
        lock(&self.summaries).push(summary.clone());
    }
}

/// Monday of the week the fixtures submit into.
pub fn fixture_week() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 12).unwrap_or_default()
}

/// Canonical post link for `shortcode`.
pub fn post_link(shortcode: &str) -> String {
    format!("https://www.instagram.com/p/{shortcode}/")
}

/// A successful lookup.
pub fn snapshot(commenters: &[&str], likers: &[&str]) -> Outcome {
    Ok(InteractionSnapshot::new(commenters, likers))
}

/// Everything one scenario needs, wired together.
pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub sessions: ScriptedSessions,
    pub notifier: RecordingNotifier,
    pub engine: Engine,
    pub week: NaiveDate,
}

impl TestBed {
    /// Build a bed whose roster is `participants`.
    pub fn new<I, S>(participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_sessions(participants, ScriptedSessions::new("helper01"))
    }

    pub fn with_sessions<I, S>(participants: I, sessions: ScriptedSessions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_config(participants, sessions, RunConfig::without_pacing())
    }

    pub fn with_config<I, S>(participants: I, sessions: ScriptedSessions, config: RunConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = participants
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        let store = Arc::new(MemoryStore::new().with_roster(names));
        let notifier = RecordingNotifier::new();
        let engine = EngineBuilder::new(store.clone(), Arc::new(sessions.clone()))
            .with_notifier(Arc::new(notifier.clone()))
            .with_config(config)
            .build();
        Self {
            store,
            sessions,
            notifier,
            engine,
            week: fixture_week(),
        }
    }

    /// Submit `owner`'s post `shortcode` for the fixture week.
    pub fn submit(&self, owner: &str, shortcode: &str) {
        self.store.add_submission(Submission {
            owner: owner.to_string(),
            link: post_link(shortcode),
            week: self.week,
        });
    }
}

#[cfg(test)]
mod tests {
    use reciprocate_core::ErrorClass;

    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let sessions = ScriptedSessions::new("helper01");
        sessions
            .on("P1", Err(ClassifiedError::retryable("HTTP 429")))
            .on("P1", snapshot(&["a"], &[]));

        let mut session = sessions.acquire().await.unwrap();
        assert_eq!(session.account(), "helper01");
        assert!(session.lookup("P1").await.is_err());
        assert!(session.lookup("P1").await.is_ok());

        let fallback = session.lookup("P1").await.unwrap_err();
        assert_eq!(fallback.class, ErrorClass::Skip);
        assert_eq!(sessions.calls(), vec!["P1", "P1", "P1"]);
        assert_eq!(sessions.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn unavailable_sessions_fail_to_acquire() {
        let sessions = ScriptedSessions::new("helper01").unavailable();
        assert!(sessions.acquire().await.is_err());
        assert_eq!(sessions.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn otherwise_overrides_the_default_skip() {
        let sessions = ScriptedSessions::new("helper01");
        sessions.otherwise(Err(ClassifiedError::retryable("timeout")));

        let mut session = sessions.acquire().await.unwrap();
        let err = session.lookup("ANY").await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Retryable);
    }
}
