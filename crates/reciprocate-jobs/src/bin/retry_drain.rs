//! Replay one batch of queued lookups.

use std::process::ExitCode;

use reciprocate_core::JobKind;

#[tokio::main]
async fn main() -> ExitCode {
    reciprocate_jobs::run_job(JobKind::RetryDrain).await
}
