//! Verify this week's submissions and record who has not reciprocated.

use std::process::ExitCode;

use reciprocate_core::JobKind;

#[tokio::main]
async fn main() -> ExitCode {
    reciprocate_jobs::run_job(JobKind::Verify).await
}
