//! Re-check recorded non-reciprocations and clear the ones that caught up.

use std::process::ExitCode;

use reciprocate_core::JobKind;

#[tokio::main]
async fn main() -> ExitCode {
    reciprocate_jobs::run_job(JobKind::Cleanup).await
}
