//! Discord webhook notifier.

use std::time::Duration;

use async_trait::async_trait;
use reciprocate_core::{Notifier, RunSummary};
use serde_json::{json, Value};
use tracing::{debug, warn};

const COLOR_SUCCESS: u32 = 0x2ecc71;
const COLOR_FAILURE: u32 = 0xe74c3c;
const MAX_LISTED_FAILURES: usize = 10;
/// Discord rejects embed field values longer than this.
const MAX_FIELD_CHARS: usize = 1024;

/// Posts one embed per run summary.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &RunSummary) {
        let payload = embed_payload(summary);
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(run_id = %summary.run_id, "run summary delivered");
            }
            Ok(response) => {
                warn!(run_id = %summary.run_id, status = response.status().as_u16(), "webhook rejected run summary");
            }
            Err(e) => {
                warn!(run_id = %summary.run_id, error = %e, "webhook delivery failed");
            }
        }
    }
}

/// Build the webhook body for `summary`.
pub fn embed_payload(summary: &RunSummary) -> Value {
    let succeeded = summary.succeeded();
    let title = if summary.critical_abort {
        format!("{} aborted: helper account blocked", summary.job.title())
    } else if succeeded {
        format!("{} finished", summary.job.title())
    } else {
        format!("{} failed", summary.job.title())
    };

    let mut fields: Vec<Value> = summary
        .counters()
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value.to_string(), "inline": true }))
        .collect();

    if let Some(week) = summary.week {
        fields.push(json!({ "name": "Week", "value": week.to_string(), "inline": true }));
    }
    if let Some(account) = &summary.account {
        fields.push(json!({ "name": "Helper", "value": format!("@{account}"), "inline": true }));
    }
    if let Some(error) = &summary.error {
        fields.push(json!({ "name": "Error", "value": clip(error), "inline": false }));
    }
    if !summary.failures.is_empty() {
        let mut lines: Vec<String> = summary
            .failures
            .iter()
            .take(MAX_LISTED_FAILURES)
            .map(|f| match &f.owner {
                Some(owner) => format!("@{owner} `{}` ({}): {}", f.shortcode, f.class, f.error),
                None => format!("`{}` ({}): {}", f.shortcode, f.class, f.error),
            })
            .collect();
        if summary.failures.len() > MAX_LISTED_FAILURES {
            lines.push(format!("... and {} more", summary.failures.len() - MAX_LISTED_FAILURES));
        }
        fields.push(json!({ "name": "Not retried", "value": clip(&lines.join("\n")), "inline": false }));
    }

    json!({
        "embeds": [{
            "title": title,
            "color": if succeeded { COLOR_SUCCESS } else { COLOR_FAILURE },
            "fields": fields,
            "footer": { "text": format!("{} run {}", summary.job, summary.run_id) },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }]
    })
}

fn clip(text: &str) -> String {
    reciprocate_core::truncate_message(text, MAX_FIELD_CHARS)
}

#[cfg(test)]
mod tests {
    use reciprocate_core::{ErrorClass, FailedLookup, JobKind};

    use super::*;

    fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
        payload["embeds"][0]["fields"]
            .as_array()?
            .iter()
            .find(|f| f["name"] == name)
    }

    #[test]
    fn successful_run_is_green_with_counters() {
        let mut summary = RunSummary::new(JobKind::Verify);
        summary.total = 4;
        summary.added = 3;

        let payload = embed_payload(&summary);
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], COLOR_SUCCESS);
        assert_eq!(embed["title"], "Engagement verification finished");
        assert_eq!(field(&payload, "Total").unwrap()["value"], "4");
        assert_eq!(field(&payload, "Added").unwrap()["value"], "3");
        assert!(field(&payload, "Error").is_none());
    }

    #[test]
    fn critical_abort_is_red_and_names_the_error() {
        let mut summary = RunSummary::new(JobKind::Cleanup);
        summary.critical_abort = true;
        summary.account = Some("helper01".to_string());
        summary.error = Some("helper account @helper01 blocked".to_string());

        let payload = embed_payload(&summary);
        assert_eq!(payload["embeds"][0]["color"], COLOR_FAILURE);
        assert_eq!(
            payload["embeds"][0]["title"],
            "Verification cleanup aborted: helper account blocked"
        );
        assert_eq!(field(&payload, "Helper").unwrap()["value"], "@helper01");
        assert!(field(&payload, "Error").is_some());
    }

    #[test]
    fn long_failure_lists_are_capped() {
        let mut summary = RunSummary::new(JobKind::Verify);
        for i in 0..12 {
            summary.failures.push(FailedLookup {
                owner: Some(format!("user{i}")),
                shortcode: format!("P{i}"),
                class: ErrorClass::Skip,
                error: "Post not found".to_string(),
            });
        }

        let payload = embed_payload(&summary);
        let listed = field(&payload, "Not retried").unwrap()["value"].as_str().unwrap();
        assert_eq!(listed.lines().count(), 11);
        assert!(listed.ends_with("... and 2 more"));
    }
}
