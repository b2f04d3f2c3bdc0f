use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{Address, OperationHandle, QueryKey};

pub mod config;
pub mod confirmation;
pub mod error;
pub mod flows;
pub mod http;
pub mod notifier;
pub mod orchestrator;
pub mod refresher;
pub mod submitter;
pub mod tracker;
pub mod types;
pub mod validation;

pub use config::{load_settings, ClientSettings};
pub use confirmation::{ConfirmationChallenge, ConfirmationGate, GateDecision, Impact};
pub use error::{
    ConfirmationError, ConfirmationMismatchError, FlowError, RefreshError, SubmissionError,
    SubmissionFailure, ValidationError,
};
pub use flows::FlowSpec;
pub use http::LedgerHttpClient;
pub use notifier::StatusNotifier;
pub use orchestrator::{FlowDependencies, FlowEvent, FlowSnapshot, SubmitProgress, TransactionFlow};
pub use refresher::DependentDataRefresher;
pub use submitter::TransactionSubmitter;
pub use tracker::{
    ConfirmationTracker, OutcomeFeed, OutcomeProbe, PollingConfirmation, ProbeStatus,
    TrackingStatus,
};
pub use types::{OperationRequest, OperationState, Outcome, Severity, StatusMessage, TerminalStatus};
pub use validation::{FormFields, InputValidator, ValidationResult};

/// Signing agent + network intake. Must report rejection before acceptance as an error.
#[async_trait]
pub trait SubmissionInterface: Send + Sync {
    async fn submit(&self, request: &OperationRequest) -> Result<OperationHandle>;
}

/// Resolves once with the terminal outcome of `handle`. An `Err` is a fault of the interface
/// itself, never an observed failure of the operation.
#[async_trait]
pub trait ConfirmationInterface: Send + Sync {
    async fn await_outcome(&self, handle: &OperationHandle) -> Result<Outcome>;
}

#[async_trait]
pub trait ReadQueryInterface: Send + Sync {
    async fn refetch(&self, key: &QueryKey) -> Result<()>;
}

/// The connected signer, if any. Used for prefill and advisory checks only; the ledger makes the
/// authoritative decision.
pub trait IdentityInterface: Send + Sync {
    fn current_signer(&self) -> Option<Address>;
}

pub struct MissingSigningAgent;

#[async_trait]
impl SubmissionInterface for MissingSigningAgent {
    async fn submit(&self, request: &OperationRequest) -> Result<OperationHandle> {
        Err(anyhow!(
            "no signing agent connected; cannot submit {}",
            request.action()
        ))
    }
}

pub struct NoReadQueries;

#[async_trait]
impl ReadQueryInterface for NoReadQueries {
    async fn refetch(&self, _key: &QueryKey) -> Result<()> {
        Ok(())
    }
}

/// Identity that changes only when told to, e.g. on wallet connect/disconnect.
#[derive(Default)]
pub struct StaticIdentity {
    signer: RwLock<Option<Address>>,
}

impl StaticIdentity {
    pub fn new(signer: Option<Address>) -> Arc<Self> {
        Arc::new(Self {
            signer: RwLock::new(signer),
        })
    }

    pub fn connect(&self, signer: Address) {
        *self
            .signer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(signer);
    }

    pub fn disconnect(&self) {
        *self
            .signer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

impl IdentityInterface for StaticIdentity {
    fn current_signer(&self) -> Option<Address> {
        self.signer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
