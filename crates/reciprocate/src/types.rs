//! Domain types shared by the reconcilers, the retry queue and the stores.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalize a platform username for set membership.
///
/// Usernames compare case-insensitively; a leading `@` and surrounding
/// whitespace are not part of the name.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

/// Active participants, normalized, fixed for the duration of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    members: BTreeSet<String>,
}

impl Roster {
    pub fn new<I, S>(usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            members: usernames
                .into_iter()
                .map(|u| normalize_username(u.as_ref()))
                .filter(|u| !u.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.members.contains(&normalize_username(username))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }
}

/// One participant's link for one week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub owner: String,
    pub link: String,
    pub week: NaiveDate,
}

/// Commenters and likers of one post at one point in time. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionSnapshot {
    commenters: BTreeSet<String>,
    likers: BTreeSet<String>,
}

impl InteractionSnapshot {
    pub fn new<C, L, S, T>(commenters: C, likers: L) -> Self
    where
        C: IntoIterator<Item = S>,
        L: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            commenters: commenters
                .into_iter()
                .map(|u| normalize_username(u.as_ref()))
                .collect(),
            likers: likers
                .into_iter()
                .map(|u| normalize_username(u.as_ref()))
                .collect(),
        }
    }

    pub fn commenters(&self) -> &BTreeSet<String> {
        &self.commenters
    }

    pub fn likers(&self) -> &BTreeSet<String> {
        &self.likers
    }

    /// Everyone who commented or liked.
    pub fn interacted(&self) -> BTreeSet<&str> {
        self.commenters
            .iter()
            .chain(self.likers.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn has_interacted(&self, username: &str) -> bool {
        let name = normalize_username(username);
        self.commenters.contains(&name) || self.likers.contains(&name)
    }
}

/// "`participant` has not yet reciprocated `link_owner`'s post at `link`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: i64,
    pub participant: String,
    pub link: String,
    pub link_owner: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a [`VerificationRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVerification {
    pub participant: String,
    pub link: String,
    pub link_owner: String,
}

/// Which reconciler a retry item replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Verify,
    Cleanup,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Verify => "verify",
            BatchType::Cleanup => "cleanup",
        }
    }
}

/// Retry item lifecycle: `Pending → Processing → {Completed | Pending | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Processing,
    Completed,
    /// Dead-lettered; needs manual review.
    Failed,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Processing => "processing",
            RetryStatus::Completed => "completed",
            RetryStatus::Failed => "failed",
        }
    }

    /// Live items block new inserts for the same (shortcode, batch type).
    pub fn is_live(&self) -> bool {
        matches!(self, RetryStatus::Pending | RetryStatus::Processing)
    }
}

/// A persisted column held a value no enum variant matches.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for BatchType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify" => Ok(BatchType::Verify),
            "cleanup" => Ok(BatchType::Cleanup),
            other => Err(ParseEnumError {
                kind: "batch type",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for RetryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RetryStatus::Pending),
            "processing" => Ok(RetryStatus::Processing),
            "completed" => Ok(RetryStatus::Completed),
            "failed" => Ok(RetryStatus::Failed),
            other => Err(ParseEnumError {
                kind: "retry status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed lookup waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: i64,
    pub link: String,
    pub shortcode: String,
    pub batch_type: BatchType,
    pub link_owner: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
}

/// Enqueue payload for a [`RetryQueueItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRetryItem {
    pub link: String,
    pub shortcode: String,
    pub batch_type: BatchType,
    pub link_owner: Option<String>,
    pub error: String,
}
