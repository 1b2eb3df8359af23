//! # Reciprocate
//!
//! Verification and retry-queue engine for a weekly engagement exchange:
//! every participant submits a link to their own post, and every other
//! participant is expected to comment on it or like it.
//!
//! ## Core Concepts
//!
//! - A [`LookupSession`] fetches an [`InteractionSnapshot`] (commenters and
//!   likers) for one post, or fails with a [`ClassifiedError`].
//! - [`reconcile::verify`] records who has not reciprocated;
//!   [`reconcile::cleanup`] clears them once they have.
//! - Retryable failures go to the durable retry queue
//!   ([`RetryQueueManager`]), which replays them with a bounded budget and
//!   dead-letters what never succeeds.
//!
//! ## Architecture
//!
//! ```text
//! Engine.run(job)
//!     │
//!     ├─► SessionProvider.acquire() ─► one LookupSession for the whole run
//!     │
//!     ▼ for each work item, strictly in order
//! LookupSession.lookup(shortcode)
//!     │
//!     ├─► Ok(snapshot) ──────────► reconcile::verify / reconcile::cleanup
//!     ├─► Err(Retryable) ────────► RetryQueueManager.enqueue
//!     ├─► Err(Skip | Unknown) ───► logged, never retried
//!     └─► Err(Critical) ─────────► abort the run (RunError::Critical)
//!
//! Engine.run(RetryDrain)
//!     ├─► RetryQueueManager.next_batch ─► empty: done, no session opened
//!     └─► RetryQueueManager.drain_batch ─► same lookup + reconcile per item
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One record per (participant, link)** - verify only inserts what is
//!    missing, cleanup only deletes
//! 2. **One live retry item per (shortcode, batch type)** - repeated failures
//!    refresh the live item
//! 3. **Bounded retries** - an item that fails `max_retry_count` times is
//!    `Failed` and never drained again
//! 4. **Critical aborts everything** - the helper account is presumed
//!    sanctioned; work committed before the abort stays committed
//! 5. **Classify once** - lookup adapters classify, orchestrators only react
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use reciprocate_core::{EngineBuilder, MemoryStore, RunConfig};
//!
//! let store = Arc::new(MemoryStore::new().with_roster(["alice", "bob"]));
//! let engine = EngineBuilder::new(store, Arc::new(my_sessions))
//!     .with_config(RunConfig::default())
//!     .build();
//!
//! let summary = engine.run_verify().await?;
//! println!("{} records added", summary.added);
//! ```

mod classify;
mod config;
mod engine;
mod error;
mod lookup;
mod memory;
mod post;
mod queue;
pub mod reconcile;
mod store;
mod summary;
mod types;

// Re-export classification
pub use classify::{
    classify, truncate_message, ClassifiedError, ErrorClass, ErrorClassifier,
    PlatformMessageClassifier,
};

// Re-export configuration
pub use config::{
    DelayRange, Pacing, RunConfig, DEFAULT_DRAIN_BATCH_SIZE, DEFAULT_WEEK_OFFSET_HOURS,
    MAX_RETRY_COUNT,
};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder};

// Re-export error types
pub use error::RunError;

// Re-export lookup port
pub use lookup::{LookupSession, PacedSession, SessionProvider};

// Re-export the in-memory store
pub use memory::MemoryStore;

// Re-export link helpers
pub use post::{extract_shortcode, week_start};

// Re-export retry queue manager
pub use queue::{DrainTarget, RetryQueueManager, MAX_ERROR_CHARS};

// Re-export persistence ports (policy-light interfaces)
pub use store::{
    EnqueueOutcome, FailureKind, QueueStats, RetryQueueStore, RetryTransition, RosterProvider,
    Store, SubmissionProvider, VerificationStore,
};

// Re-export summaries and notification
pub use summary::{FailedLookup, JobKind, NoOpNotifier, Notifier, RunSummary};

// Re-export domain types
pub use types::{
    normalize_username, BatchType, InteractionSnapshot, NewRetryItem, NewVerification,
    ParseEnumError, RetryQueueItem, RetryStatus, Roster, Submission, VerificationRecord,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
