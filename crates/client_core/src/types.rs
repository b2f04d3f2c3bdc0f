//! Values that flow between the orchestrator components.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use shared::domain::{ActionId, CorrelationId};

/// A validated write ready for submission. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRequest {
    action: ActionId,
    args: Vec<Value>,
    value: Option<String>,
    correlation_id: CorrelationId,
}

impl OperationRequest {
    pub fn new(action: ActionId, args: Vec<Value>, value: Option<String>) -> Self {
        Self {
            action,
            args,
            value,
            correlation_id: CorrelationId::new(),
        }
    }

    pub fn action(&self) -> &ActionId {
        &self.action
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Value to transfer in base units.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationState {
    Idle,
    Validating,
    AwaitingConfirmationStep,
    Submitting,
    Pending,
    Confirmed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Confirmed | OperationState::Failed)
    }

    /// Whether a submission is in flight and a second submit must be refused.
    pub fn is_busy(self) -> bool {
        matches!(self, OperationState::Submitting | OperationState::Pending)
    }

    /// Forward edges of the lifecycle. `Idle` is reachable from everything except
    /// `Submitting` and is handled by [`OperationState::can_reset`].
    pub fn can_advance_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, AwaitingConfirmationStep)
                | (Validating, Submitting)
                | (AwaitingConfirmationStep, Submitting)
                | (Submitting, Pending)
                | (Submitting, Failed)
                | (Pending, Confirmed)
                | (Pending, Failed)
        )
    }

    pub fn can_reset(self) -> bool {
        self != OperationState::Submitting
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationState::Idle => "idle",
            OperationState::Validating => "validating",
            OperationState::AwaitingConfirmationStep => "awaiting_confirmation",
            OperationState::Submitting => "submitting",
            OperationState::Pending => "pending",
            OperationState::Confirmed => "confirmed",
            OperationState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminalStatus {
    Confirmed,
    Failed,
}

/// Terminal result reported by the network for one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub status: TerminalStatus,
    pub detail: Option<String>,
}

impl Outcome {
    pub fn confirmed() -> Self {
        Self {
            status: TerminalStatus::Confirmed,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub id: u64,
    pub text: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}
