//! Run-level error types.

use thiserror::Error;

/// Why a batch run stopped before finishing its work set.
#[derive(Debug, Error)]
pub enum RunError {
    /// The helper account is sanctioned. Every remaining lookup in the run
    /// is abandoned and an operator has to look at the account.
    #[error("helper account @{account} blocked while looking up {shortcode}: {message}")]
    Critical {
        account: String,
        shortcode: String,
        message: String,
    },

    /// No lookup session could be opened.
    #[error("no lookup session available: {0}")]
    SessionUnavailable(String),

    /// A persistence port failed.
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl RunError {
    pub fn is_critical(&self) -> bool {
        matches!(self, RunError::Critical { .. })
    }

    /// Process exit code for a job binary: 2 for a critical abort, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_critical() {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_errors_name_the_account() {
        let err = RunError::Critical {
            account: "helper01".into(),
            shortcode: "ABC".into(),
            message: "feedback_required".into(),
        };
        assert!(err.is_critical());
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("@helper01"));
    }

    #[test]
    fn store_errors_keep_context() {
        let err: RunError = anyhow::anyhow!("connection refused")
            .context("loading roster")
            .into();
        assert!(!err.is_critical());
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("loading roster"));
        assert!(err.to_string().contains("connection refused"));
    }
}
