//! PostgreSQL implementation of the reciprocate persistence ports.
//!
//! [`PgStore`] implements every port the engine persists through
//! ([`RosterProvider`], [`SubmissionProvider`], [`VerificationStore`] and
//! [`RetryQueueStore`]) and hands out helper accounts for lookup sessions.
//!
//! # Features
//!
//! - `(participant, link)` uniqueness enforced by a table constraint
//! - At most one live retry item per `(shortcode, batch_type)`, enforced by a
//!   partial unique index and `ON CONFLICT`
//! - Failure accounting under `FOR UPDATE` so concurrent drains cannot lose
//!   an attempt
//! - Least-recently-used helper account checkout
//!
//! # Database Schema
//!
//! See `migrations/0001_init.sql`. The retry queue is the interesting part:
//!
//! ```sql
//! CREATE TABLE retry_queue (
//!     id BIGSERIAL PRIMARY KEY,
//!     link TEXT NOT NULL,
//!     shortcode TEXT NOT NULL,
//!     batch_type TEXT NOT NULL,          -- 'verify' | 'cleanup'
//!     link_owner TEXT,
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     last_error TEXT,
//!     last_attempt_at TIMESTAMPTZ,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE UNIQUE INDEX idx_retry_queue_live ON retry_queue (shortcode, batch_type)
//!     WHERE status IN ('pending', 'processing');
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use reciprocate_postgres::PgStore;
//!
//! let store = PgStore::connect("postgres://localhost/reciprocate").await?;
//! store.migrate().await?;
//!
//! let engine = EngineBuilder::new(Arc::new(store.clone()), sessions).build();
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reciprocate_core::{
    EnqueueOutcome, FailureKind, NewRetryItem, NewVerification, QueueStats, RetryQueueItem,
    RetryQueueStore, RetryStatus, RetryTransition, Roster, RosterProvider, Submission,
    SubmissionProvider, VerificationRecord, VerificationStore,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

const RETRY_COLUMNS: &str = "id, link, shortcode, batch_type, link_owner, retry_count, \
                             last_error, last_attempt_at, status, created_at";

/// A helper account checked out for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperAccount {
    pub username: String,
    pub session_token: String,
}

/// Why no helper account could be checked out.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("no active helper account")]
    NoActiveAccount,

    #[error("helper account '{0}' has no stored session")]
    MissingSession(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// PostgreSQL store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a pool sized for one serial batch run.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> VerificationRecord {
    VerificationRecord {
        id: row.get("id"),
        participant: row.get("participant"),
        link: row.get("link"),
        link_owner: row.get("link_owner"),
        created_at: row.get("created_at"),
    }
}

fn retry_item_from_row(row: &PgRow) -> Result<RetryQueueItem> {
    let batch_type: String = row.get("batch_type");
    let status: String = row.get("status");
    Ok(RetryQueueItem {
        id: row.get("id"),
        link: row.get("link"),
        shortcode: row.get("shortcode"),
        batch_type: batch_type.parse()?,
        link_owner: row.get("link_owner"),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        last_attempt_at: row.get("last_attempt_at"),
        status: status.parse()?,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl RosterProvider for PgStore {
    async fn roster(&self) -> Result<Roster> {
        let usernames: Vec<String> = sqlx::query_scalar(
            "SELECT username FROM participants WHERE active ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(Roster::new(usernames))
    }
}

#[async_trait]
impl SubmissionProvider for PgStore {
    async fn submissions_for_week(&self, week: NaiveDate) -> Result<Vec<Submission>> {
        let rows = sqlx::query(
            r#"
            SELECT owner, link, week
            FROM submissions
            WHERE week = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(week)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Submission {
                owner: row.get("owner"),
                link: row.get("link"),
                week: row.get("week"),
            })
            .collect())
    }
}

#[async_trait]
impl VerificationStore for PgStore {
    async fn insert_if_absent(&self, record: NewVerification) -> Result<Option<VerificationRecord>> {
        let row = sqlx::query(
            r#"
            INSERT INTO verifications (participant, link, link_owner)
            VALUES ($1, $2, $3)
            ON CONFLICT (participant, link) DO NOTHING
            RETURNING id, participant, link, link_owner, created_at
            "#,
        )
        .bind(&record.participant)
        .bind(&record.link)
        .bind(&record.link_owner)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row))
    }

    async fn records_for_link(&self, link: &str) -> Result<Vec<VerificationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, participant, link, link_owner, created_at
            FROM verifications
            WHERE link = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(link)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn all_records(&self) -> Result<Vec<VerificationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, participant, link, link_owner, created_at
            FROM verifications
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn delete_record(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM verifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RetryQueueStore for PgStore {
    /// Insert a pending item or refresh the live one.
    ///
    /// The conflict target is the partial unique index over live items, so
    /// completed and failed items never block a new insert.
    async fn enqueue(&self, item: NewRetryItem) -> Result<EnqueueOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO retry_queue
                (link, shortcode, batch_type, link_owner, last_error, last_attempt_at, status)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'pending')
            ON CONFLICT (shortcode, batch_type) WHERE status IN ('pending', 'processing')
            DO UPDATE SET last_error = EXCLUDED.last_error,
                          last_attempt_at = EXCLUDED.last_attempt_at
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&item.link)
        .bind(&item.shortcode)
        .bind(item.batch_type.as_str())
        .bind(&item.link_owner)
        .bind(&item.error)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get("id");
        Ok(if row.get::<bool, _>("inserted") {
            EnqueueOutcome::Inserted(id)
        } else {
            EnqueueOutcome::Refreshed(id)
        })
    }

    async fn pending(&self, limit: i64) -> Result<Vec<RetryQueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue \
             WHERE status = 'pending' \
             ORDER BY created_at ASC, id ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(retry_item_from_row).collect()
    }

    async fn mark_processing(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE retry_queue
            SET status = 'processing',
                last_attempt_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE retry_queue SET status = 'completed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            bail!("retry item {id} not found");
        }
        Ok(())
    }

    /// Count a failed attempt.
    ///
    /// The row is locked while the next state is computed so two drains
    /// failing the same item cannot both read the same `retry_count`.
    async fn record_failure(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        max_retry_count: i32,
    ) -> Result<RetryTransition> {
        let mut tx = self.pool.begin().await?;

        let retry_count: Option<i32> =
            sqlx::query_scalar("SELECT retry_count FROM retry_queue WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(retry_count) = retry_count else {
            bail!("retry item {id} not found");
        };

        let transition = RetryTransition::after_failure(retry_count, kind, max_retry_count);

        sqlx::query(
            r#"
            UPDATE retry_queue
            SET retry_count = $1,
                status = $2,
                last_error = $3
            WHERE id = $4
            "#,
        )
        .bind(transition.retry_count)
        .bind(transition.status.as_str())
        .bind(error)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if transition.status == RetryStatus::Failed {
            debug!(id, retry_count = transition.retry_count, "retry item dead-lettered");
        }
        Ok(transition)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM retry_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }
}

/// Helper accounts.
impl PgStore {
    /// Check out the active helper account used least recently.
    ///
    /// Accounts never used come first. The checkout stamps `last_used_at`
    /// so consecutive runs rotate through the pool.
    pub async fn checkout_helper(&self) -> std::result::Result<HelperAccount, CheckoutError> {
        let row = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id
                FROM helper_accounts
                WHERE active
                ORDER BY last_used_at ASC NULLS FIRST, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE helper_accounts
            SET last_used_at = NOW()
            WHERE id IN (SELECT id FROM picked)
            RETURNING username, session_token
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CheckoutError::NoActiveAccount)?;

        let username: String = row.get("username");
        let session_token: Option<String> = row.get("session_token");
        match session_token.filter(|token| !token.trim().is_empty()) {
            Some(session_token) => {
                info!(account = %username, "helper account checked out");
                Ok(HelperAccount {
                    username,
                    session_token,
                })
            }
            None => {
                warn!(account = %username, "helper account has no stored session");
                Err(CheckoutError::MissingSession(username))
            }
        }
    }

    /// Add a helper account or replace its session. Reactivates the account.
    pub async fn upsert_helper(&self, username: &str, session_token: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO helper_accounts (username, session_token)
            VALUES ($1, $2)
            ON CONFLICT (username) DO UPDATE
            SET session_token = EXCLUDED.session_token,
                active = TRUE
            "#,
        )
        .bind(username)
        .bind(session_token)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Take a helper account out of rotation, typically after a critical
    /// platform error.
    pub async fn deactivate_helper(&self, username: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE helper_accounts SET active = FALSE WHERE username = $1 AND active")
                .bind(username)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Roster and submission seeding.
impl PgStore {
    pub async fn add_participant(&self, username: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO participants (username)
            VALUES ($1)
            ON CONFLICT (username) DO UPDATE SET active = TRUE
            "#,
        )
        .bind(reciprocate_core::normalize_username(username))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record `owner`'s link for `week`, replacing an earlier one.
    pub async fn submit(&self, owner: &str, link: &str, week: NaiveDate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO submissions (owner, link, week)
            VALUES ($1, $2, $3)
            ON CONFLICT (owner, week) DO UPDATE SET link = EXCLUDED.link
            "#,
        )
        .bind(reciprocate_core::normalize_username(owner))
        .bind(link)
        .bind(week)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Manual triage.
impl PgStore {
    /// Return items stuck in `processing` since before `older_than` to
    /// `pending`.
    ///
    /// Items stay in `processing` when a run aborts mid-item. This is an
    /// operator tool; no job calls it.
    pub async fn release_stuck(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE retry_queue
            SET status = 'pending'
            WHERE status = 'processing'
              AND (last_attempt_at IS NULL OR last_attempt_at < $1)
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(released = result.rows_affected(), "stuck retry items released");
        }
        Ok(result.rows_affected())
    }

    /// Dead-lettered items, newest first, for review.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<RetryQueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue \
             WHERE status = 'failed' \
             ORDER BY last_attempt_at DESC NULLS LAST, id DESC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(retry_item_from_row).collect()
    }

    /// Fetch one retry item by id.
    pub async fn retry_item(&self, id: i64) -> Result<Option<RetryQueueItem>> {
        let row = sqlx::query(&format!("SELECT {RETRY_COLUMNS} FROM retry_queue WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(retry_item_from_row).transpose()
    }
}
