//! Scheduled job binaries for reciprocate.
//!
//! Each binary runs one [`JobKind`] against Postgres and the scraping
//! service, then exits:
//!
//! | binary        | job                     |
//! |---------------|-------------------------|
//! | `verify-run`  | [`JobKind::Verify`]     |
//! | `cleanup-run` | [`JobKind::Cleanup`]    |
//! | `retry-drain` | [`JobKind::RetryDrain`] |
//!
//! Exit codes: 0 when the run finished, 2 when a critical platform error
//! aborted it, 1 for anything else. A helper account that triggered a
//! critical abort is deactivated so the next run checks out another one.

mod config;
mod http_lookup;
mod webhook;

use std::process::ExitCode;
use std::sync::Arc;

use reciprocate_core::{EngineBuilder, JobKind, RunError, RunSummary};
use reciprocate_postgres::PgStore;
use thiserror::Error;
use tracing::{error, info, warn};

pub use config::{ConfigError, JobsConfig};
pub use http_lookup::{HttpLookupSession, HttpSessions};
pub use webhook::{embed_payload, WebhookNotifier};

/// Why a job process failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("startup: {0:#}")]
    Setup(anyhow::Error),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl JobError {
    pub fn exit_code(&self) -> u8 {
        match self {
            JobError::Run(err) => err.exit_code(),
            JobError::Config(_) | JobError::Setup(_) => 1,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Entry point shared by the three binaries.
pub async fn run_job(job: JobKind) -> ExitCode {
    // Read first so `RUST_LOG` from `.env` reaches the subscriber.
    let config = JobsConfig::from_env();
    init_tracing();

    let result = match config {
        Ok(config) => execute(job, config).await,
        Err(err) => Err(err.into()),
    };
    match result {
        Ok(summary) => {
            info!(job = %job, run_id = %summary.run_id, failed = summary.failed(), "job finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(job = %job, error = %err, "job failed");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn execute(job: JobKind, config: JobsConfig) -> Result<RunSummary, JobError> {
    let store = PgStore::connect(&config.database_url)
        .await
        .map_err(JobError::Setup)?;
    store.migrate().await.map_err(JobError::Setup)?;

    let sessions = HttpSessions::new(store.clone(), &config.lookup_url, config.lookup_timeout)
        .map_err(JobError::Setup)?;

    let mut builder = EngineBuilder::new(Arc::new(store.clone()), Arc::new(sessions))
        .with_config(config.run.clone());
    match &config.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url).map_err(JobError::Setup)?;
            builder = builder.with_notifier(Arc::new(notifier));
        }
        None => warn!("DISCORD_WEBHOOK_URL not set, run summary will only be logged"),
    }
    let engine = builder.build();

    let result = engine.run(job).await;
    if let Err(RunError::Critical { account, .. }) = &result {
        match store.deactivate_helper(account).await {
            Ok(true) => warn!(account = %account, "helper account taken out of rotation"),
            Ok(false) => {}
            Err(e) => error!(account = %account, error = %e, "could not deactivate helper account"),
        }
    }
    result.map_err(JobError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_separate_critical_aborts() {
        let critical = JobError::from(RunError::Critical {
            account: "helper01".to_string(),
            shortcode: "P1".to_string(),
            message: "challenge_required".to_string(),
        });
        assert_eq!(critical.exit_code(), 2);

        let session = JobError::from(RunError::SessionUnavailable("no active helper account".into()));
        assert_eq!(session.exit_code(), 1);

        let config = JobError::from(ConfigError::Missing("RECIPROCATE_DATABASE_URL"));
        assert_eq!(config.exit_code(), 1);
        assert_eq!(
            config.to_string(),
            "configuration: RECIPROCATE_DATABASE_URL is not set"
        );
    }
}
