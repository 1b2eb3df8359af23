//! Engagement lookup port.
//!
//! A [`SessionProvider`] hands out one [`LookupSession`] per batch run. The
//! session is bound to a single helper account and is used strictly serially;
//! it is never shared between runs.

use async_trait::async_trait;
use tracing::debug;

use crate::classify::{ClassifiedError, ErrorClass};
use crate::config::{DelayRange, Pacing};
use crate::types::InteractionSnapshot;

/// Opens lookup sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Acquire a session for one run.
    ///
    /// Fails when no helper account is usable; the run cannot start.
    async fn acquire(&self) -> anyhow::Result<Box<dyn LookupSession>>;
}

/// A live session against the platform, owned by one run.
#[async_trait]
pub trait LookupSession: Send {
    /// Helper account the session acts as. Used in logs and critical errors.
    fn account(&self) -> &str;

    /// Fetch commenters and likers of the post with `shortcode`.
    async fn lookup(&mut self, shortcode: &str) -> Result<InteractionSnapshot, ClassifiedError>;
}

/// Wraps a session and sleeps a randomized interval after every lookup.
///
/// Critical failures return immediately: the run is about to abort.
pub struct PacedSession {
    inner: Box<dyn LookupSession>,
    pacing: Pacing,
}

impl PacedSession {
    pub fn new(inner: Box<dyn LookupSession>, pacing: Pacing) -> Self {
        Self { inner, pacing }
    }

    fn delay_for(&self, outcome: &Result<InteractionSnapshot, ClassifiedError>) -> Option<DelayRange> {
        match outcome {
            Ok(_) => Some(self.pacing.after_success),
            Err(err) => match err.class {
                ErrorClass::Critical => None,
                ErrorClass::Skip => Some(self.pacing.after_skip),
                ErrorClass::Retryable | ErrorClass::Unknown => Some(self.pacing.after_retryable),
            },
        }
    }
}

#[async_trait]
impl LookupSession for PacedSession {
    fn account(&self) -> &str {
        self.inner.account()
    }

    async fn lookup(&mut self, shortcode: &str) -> Result<InteractionSnapshot, ClassifiedError> {
        let outcome = self.inner.lookup(shortcode).await;

        if let Some(range) = self.delay_for(&outcome) {
            if !range.is_zero() {
                let pause = range.pick();
                debug!(shortcode, pause_ms = pause.as_millis() as u64, "pacing after lookup");
                tokio::time::sleep(pause).await;
            }
        }

        outcome
    }
}
