//! Lookup sessions backed by the scraping service.
//!
//! `GET {base}/posts/{shortcode}/interactions` answers `200` with
//! `{"commenters": [...], "likers": [...]}`. Anything else carries the
//! platform's own error text, which is classified here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reciprocate_core::{
    ClassifiedError, ErrorClass, ErrorClassifier, InteractionSnapshot, LookupSession,
    PlatformMessageClassifier, SessionProvider,
};
use reciprocate_postgres::{HelperAccount, PgStore};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

const ACCOUNT_HEADER: &str = "x-helper-account";
const SESSION_HEADER: &str = "x-helper-session";

#[derive(Debug, Deserialize)]
struct InteractionsBody {
    #[serde(default)]
    commenters: Vec<String>,
    #[serde(default)]
    likers: Vec<String>,
}

/// Opens one [`HttpLookupSession`] per run with a checked-out helper account.
pub struct HttpSessions {
    store: PgStore,
    client: reqwest::Client,
    base_url: String,
    classifier: Arc<dyn ErrorClassifier>,
}

impl HttpSessions {
    pub fn new(store: PgStore, base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reciprocate-jobs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            store,
            client,
            base_url: base_url.into(),
            classifier: Arc::new(PlatformMessageClassifier),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

#[async_trait]
impl SessionProvider for HttpSessions {
    async fn acquire(&self) -> anyhow::Result<Box<dyn LookupSession>> {
        let account = self.store.checkout_helper().await?;
        Ok(Box::new(HttpLookupSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            account,
            classifier: self.classifier.clone(),
        }))
    }
}

/// One helper account's session against the scraping service.
pub struct HttpLookupSession {
    client: reqwest::Client,
    base_url: String,
    account: HelperAccount,
    classifier: Arc<dyn ErrorClassifier>,
}

impl HttpLookupSession {
    fn url(&self, shortcode: &str) -> String {
        format!("{}/posts/{}/interactions", self.base_url, shortcode)
    }
}

#[async_trait]
impl LookupSession for HttpLookupSession {
    fn account(&self) -> &str {
        &self.account.username
    }

    async fn lookup(&mut self, shortcode: &str) -> Result<InteractionSnapshot, ClassifiedError> {
        let response = self
            .client
            .get(self.url(shortcode))
            .header(ACCOUNT_HEADER, &self.account.username)
            .header(SESSION_HEADER, &self.account.session_token)
            .send()
            .await
            .map_err(|e| ClassifiedError::retryable(format!("lookup request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifiedError::retryable(format!("lookup response interrupted: {e}")))?;
        debug!(shortcode, status = status.as_u16(), bytes = body.len(), "lookup answered");

        if status.is_success() {
            parse_snapshot(&body)
        } else {
            Err(classify_response(self.classifier.as_ref(), status, &body))
        }
    }
}

fn parse_snapshot(body: &str) -> Result<InteractionSnapshot, ClassifiedError> {
    let parsed: InteractionsBody = serde_json::from_str(body).map_err(|e| {
        ClassifiedError::new(ErrorClass::Unknown, format!("malformed lookup response: {e}"))
    })?;
    Ok(InteractionSnapshot::new(parsed.commenters, parsed.likers))
}

/// Classify a non-2xx answer.
///
/// The message is the body when there is one, the status reason otherwise.
/// Throttling and server-side statuses are retryable unless the body names an
/// account sanction.
fn classify_response(classifier: &dyn ErrorClassifier, status: StatusCode, body: &str) -> ClassifiedError {
    let detail = match body.trim() {
        "" => status.canonical_reason().unwrap_or("no response body"),
        text => text,
    };
    let message = format!("HTTP {}: {}", status.as_u16(), detail);
    let class = classifier.classify(&message);

    let transient = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error();
    if transient && class != ErrorClass::Critical {
        return ClassifiedError::new(ErrorClass::Retryable, message);
    }
    ClassifiedError::new(class, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16, body: &str) -> ClassifiedError {
        let status = StatusCode::from_u16(status).unwrap();
        classify_response(&PlatformMessageClassifier, status, body)
    }

    #[test]
    fn success_body_becomes_snapshot() {
        let snap = parse_snapshot(r#"{"commenters": ["Alice"], "likers": ["bob", "alice"]}"#).unwrap();
        assert!(snap.has_interacted("alice"));
        assert!(snap.has_interacted("bob"));
        assert_eq!(snap.commenters().len(), 1);
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let snap = parse_snapshot(r#"{"commenters": ["alice"]}"#).unwrap();
        assert!(snap.likers().is_empty());
    }

    #[test]
    fn malformed_body_is_unknown() {
        let err = parse_snapshot("<html>").unwrap_err();
        assert_eq!(err.class, ErrorClass::Unknown);
    }

    #[test]
    fn sanctions_in_the_body_are_critical_whatever_the_status() {
        assert_eq!(classify(400, "challenge_required").class, ErrorClass::Critical);
        assert_eq!(classify(503, "feedback_required").class, ErrorClass::Critical);
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify(429, "").class, ErrorClass::Retryable);
        assert_eq!(classify(503, "").class, ErrorClass::Retryable);
        assert_eq!(classify(500, "media unavailable").class, ErrorClass::Retryable);
    }

    #[test]
    fn missing_posts_are_skipped() {
        let err = classify(404, "");
        assert_eq!(err.class, ErrorClass::Skip);
        assert_eq!(err.message, "HTTP 404: Not Found");
        assert_eq!(classify(400, "Media not found or unavailable").class, ErrorClass::Skip);
    }

    #[test]
    fn unrecognised_client_errors_stay_unknown() {
        assert_eq!(classify(400, "bad cursor").class, ErrorClass::Unknown);
    }
}
