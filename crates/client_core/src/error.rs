//! Failure taxonomy for one write flow.

use std::fmt;

use shared::domain::QueryKey;
use thiserror::Error;

use crate::{types::OperationState, validation::ValidationResult};

#[derive(Debug, Clone, Error)]
pub struct ValidationError {
    pub result: ValidationResult,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input is invalid: {}", self.result.summary())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmationMismatchError {
    #[error("confirmation does not match; type it exactly as shown")]
    Mismatch,
    #[error("confirmation expired; cancel and start again")]
    Expired,
    #[error("no confirmation is pending")]
    NotAwaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFailure {
    /// The user declined in the signing agent.
    Declined,
    /// The network or signing agent refused the request before accepting it.
    Rejected,
    /// The request never reached anyone able to accept it.
    Transport,
}

#[derive(Debug, Clone, Error)]
pub struct SubmissionError {
    pub kind: SubmissionFailure,
    pub message: String,
}

impl SubmissionError {
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if lower.contains("user rejected")
            || lower.contains("user denied")
            || lower.contains("declined")
            || lower.contains("cancelled by user")
        {
            SubmissionFailure::Declined
        } else if lower.contains("failed to connect")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("dns")
            || lower.contains("unreachable")
        {
            SubmissionFailure::Transport
        } else {
            SubmissionFailure::Rejected
        };
        Self { kind, message }
    }
}

impl fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SubmissionFailure::Declined => write!(f, "Request declined in wallet"),
            SubmissionFailure::Transport => write!(
                f,
                "Network unreachable; check connection and retry ({})",
                self.message
            ),
            SubmissionFailure::Rejected => write!(f, "Request rejected: {}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation failed on the network: {reason}")]
pub struct ConfirmationError {
    pub reason: String,
}

impl ConfirmationError {
    pub fn from_detail(detail: Option<&str>) -> Self {
        let reason = detail
            .map(str::trim)
            .filter(|detail| !detail.is_empty())
            .unwrap_or("operation reverted without a reason")
            .to_string();
        Self { reason }
    }
}

#[derive(Debug, Clone, Error)]
pub struct RefreshError {
    pub failures: Vec<(QueryKey, String)>,
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.failures.iter().map(|(key, _)| key.as_str()).collect();
        write!(f, "failed to refresh {}", keys.join(", "))
    }
}

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    ConfirmationMismatch(#[from] ConfirmationMismatchError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),
    #[error("a submission is already in flight")]
    InFlight,
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: OperationState,
    },
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
