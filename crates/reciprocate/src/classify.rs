//! Failure taxonomy for engagement lookups.
//!
//! Lookups fail for three very different reasons and the orchestrators react
//! to each differently:
//!
//! - [`ErrorClass::Critical`]: the acting account is sanctioned. Stop the run.
//! - [`ErrorClass::Skip`]: the post itself is gone or closed. Never retry.
//! - [`ErrorClass::Retryable`]: throttling or a transient failure. Queue it.
//!
//! Anything unrecognised is [`ErrorClass::Unknown`], which every consumer
//! treats as `Skip` (see [`ErrorClass::is_retryable`]).
//!
//! Classification happens once, inside the lookup adapter. Orchestrators only
//! ever match on the class carried by a [`ClassifiedError`].

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Critical,
    Skip,
    Retryable,
    Unknown,
}

impl ErrorClass {
    pub fn is_critical(&self) -> bool {
        matches!(self, ErrorClass::Critical)
    }

    /// Only `Retryable` goes to the retry queue. `Unknown` does not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Critical => "critical",
            ErrorClass::Skip => "skip",
            ErrorClass::Retryable => "retryable",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw failure message from a lookup backend onto an [`ErrorClass`].
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, raw: &str) -> ErrorClass;
}

/// Account sanctions. Checked first.
const CRITICAL_MARKERS: &[&str] = &[
    "feedback_required",
    "challenge_required",
    "checkpoint_required",
    "consent_required",
    "spam",
    "login_required",
    "login required",
];

/// The target post is permanently unreachable.
const SKIP_MARKERS: &[&str] = &[
    "not found",
    "deleted",
    "private",
    "comments disabled",
    "unavailable",
];

/// Throttling and transient request failures.
const RETRYABLE_MARKERS: &[&str] = &[
    "429",
    "too many requests",
    "please wait a few minutes",
    "something went wrong",
    "fail",
];

/// Substring classifier for the platform's error messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformMessageClassifier;

impl ErrorClassifier for PlatformMessageClassifier {
    fn classify(&self, raw: &str) -> ErrorClass {
        classify(raw)
    }
}

/// Classify a raw platform message. Case-insensitive and deterministic.
///
/// Markers are checked Critical, then Skip, then Retryable: a message such as
/// "checkpoint_required: request failed" must stop the run, not be queued.
pub fn classify(raw: &str) -> ErrorClass {
    let msg = raw.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| msg.contains(m));

    if contains_any(CRITICAL_MARKERS) {
        ErrorClass::Critical
    } else if contains_any(SKIP_MARKERS) {
        ErrorClass::Skip
    } else if contains_any(RETRYABLE_MARKERS) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Unknown
    }
}

/// A lookup failure together with its class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Classify `message` with the given classifier.
    pub fn from_message(classifier: &dyn ErrorClassifier, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classifier.classify(&message),
            message,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Critical, message)
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Skip, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retryable, message)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lookup failure: {}", self.class, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

/// Cut `message` to at most `max_chars` characters.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanctions_are_critical() {
        for msg in [
            "feedback_required: We restrict certain activity",
            "Challenge_Required",
            "checkpoint_required",
            "consent_required",
            "Your account was flagged as spam",
            "Login required to access this post",
            "login_required",
        ] {
            assert_eq!(classify(msg), ErrorClass::Critical, "{msg}");
        }
    }

    #[test]
    fn unreachable_posts_are_skipped() {
        for msg in [
            "Post ABC not found",
            "Media has been deleted",
            "This account is private",
            "Comments disabled for this media",
            "Content unavailable",
        ] {
            assert_eq!(classify(msg), ErrorClass::Skip, "{msg}");
        }
    }

    #[test]
    fn throttling_is_retryable() {
        for msg in [
            "HTTP 429",
            "Too Many Requests",
            "Please wait a few minutes before you try again.",
            "Something went wrong",
            "JSON Query to graphql/query: request failed",
        ] {
            assert_eq!(classify(msg), ErrorClass::Retryable, "{msg}");
        }
    }

    #[test]
    fn critical_wins_over_other_markers() {
        assert_eq!(
            classify("checkpoint_required: request failed (429)"),
            ErrorClass::Critical
        );
        assert_eq!(classify("post not found: request failed"), ErrorClass::Skip);
    }

    #[test]
    fn unrecognised_messages_are_unknown_and_not_retried() {
        let class = classify("connection reset by peer");
        assert_eq!(class, ErrorClass::Unknown);
        assert!(!class.is_retryable());
        assert!(!class.is_critical());
    }

    #[test]
    fn classification_is_deterministic() {
        let msg = "Something went wrong (HTTP 429)";
        let first = classify(msg);
        for _ in 0..10 {
            assert_eq!(classify(msg), first);
        }
    }

    #[test]
    fn classified_error_uses_given_classifier() {
        struct AlwaysSkip;
        impl ErrorClassifier for AlwaysSkip {
            fn classify(&self, _raw: &str) -> ErrorClass {
                ErrorClass::Skip
            }
        }

        let err = ClassifiedError::from_message(&AlwaysSkip, "HTTP 429");
        assert_eq!(err.class, ErrorClass::Skip);
        let err = ClassifiedError::from_message(&PlatformMessageClassifier, "HTTP 429");
        assert_eq!(err.class, ErrorClass::Retryable);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_message("abcdef", 3), "abc");
        assert_eq!(truncate_message("abc", 10), "abc");
        assert_eq!(truncate_message("계정차단됨", 2), "계정");
    }
}
