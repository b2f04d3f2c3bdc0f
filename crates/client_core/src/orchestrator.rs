//! The lifecycle state machine shared by every write flow:
//! `Idle -> Validating -> (AwaitingConfirmationStep) -> Submitting -> Pending -> Confirmed | Failed`,
//! with `reset` back to `Idle` from anywhere except `Submitting`.

use std::sync::Arc;

use shared::domain::{CorrelationId, OperationHandle, QueryKey};
use tokio::{
    sync::{broadcast, watch, Mutex, MutexGuard},
    task::AbortHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    confirmation::{ConfirmationChallenge, ConfirmationGate, GateDecision},
    error::{ConfirmationError, FlowError, ValidationError},
    flows::FlowSpec,
    notifier::StatusNotifier,
    refresher::DependentDataRefresher,
    submitter::TransactionSubmitter,
    tracker::ConfirmationTracker,
    types::{OperationRequest, OperationState, Outcome, Severity, StatusMessage, TerminalStatus},
    validation::{FormFields, ValidationResult},
    ConfirmationInterface, IdentityInterface, ReadQueryInterface, SubmissionInterface,
};

/// External collaborators a flow talks to.
#[derive(Clone)]
pub struct FlowDependencies {
    pub submission: Arc<dyn SubmissionInterface>,
    pub confirmation: Arc<dyn ConfirmationInterface>,
    pub reader: Arc<dyn ReadQueryInterface>,
    pub identity: Arc<dyn IdentityInterface>,
}

#[derive(Debug, Clone)]
pub enum FlowEvent {
    Transition {
        from: OperationState,
        to: OperationState,
        correlation_id: Option<CorrelationId>,
    },
    Status(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitProgress {
    AwaitingConfirmation(ConfirmationChallenge),
    Pending(OperationHandle),
}

#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub state: OperationState,
    pub fields: FormFields,
    pub validation: ValidationResult,
    pub challenge: Option<ConfirmationChallenge>,
    pub handle: Option<OperationHandle>,
    pub failure: Option<String>,
    pub status: Option<StatusMessage>,
}

struct FlowState {
    state: OperationState,
    fields: FormFields,
    validation: ValidationResult,
    gate: ConfirmationGate,
    request: Option<OperationRequest>,
    handle: Option<OperationHandle>,
    failure: Option<String>,
    in_flight: bool,
    /// Task following the current handle while it is `Pending`.
    follow: Option<AbortHandle>,
}

struct FlowShared {
    spec: FlowSpec,
    identity: Arc<dyn IdentityInterface>,
    submitter: TransactionSubmitter,
    tracker: Arc<ConfirmationTracker>,
    notifier: StatusNotifier,
    refresher: DependentDataRefresher,
    settings: ClientSettings,
    state: Mutex<FlowState>,
    state_tx: watch::Sender<OperationState>,
    events: broadcast::Sender<FlowEvent>,
}

/// One orchestrated write flow. Clones share the same instance.
#[derive(Clone)]
pub struct TransactionFlow {
    shared: Arc<FlowShared>,
}

impl TransactionFlow {
    pub fn new(spec: FlowSpec, deps: FlowDependencies, settings: &ClientSettings) -> Self {
        let (state_tx, _) = watch::channel(OperationState::Idle);
        let (events, _) = broadcast::channel(128);
        let gate = ConfirmationGate::new(
            spec.impact,
            settings.confirmation_code_length,
            settings.confirmation_token_ttl,
        );
        let refresher = DependentDataRefresher::new(deps.reader, spec.affected_queries.clone());
        Self {
            shared: Arc::new(FlowShared {
                identity: deps.identity,
                submitter: TransactionSubmitter::new(deps.submission),
                tracker: Arc::new(ConfirmationTracker::new(
                    deps.confirmation,
                    settings.poll_interval,
                )),
                notifier: StatusNotifier::new(settings.status_ttl),
                refresher,
                settings: settings.clone(),
                state: Mutex::new(FlowState {
                    state: OperationState::Idle,
                    fields: FormFields::new(),
                    validation: ValidationResult::default(),
                    gate,
                    request: None,
                    handle: None,
                    failure: None,
                    in_flight: false,
                    follow: None,
                }),
                state_tx,
                events,
                spec,
            }),
        }
    }

    pub fn spec(&self) -> &FlowSpec {
        &self.shared.spec
    }

    pub fn affected_queries(&self) -> &[QueryKey] {
        self.shared.refresher.affected_queries()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.shared.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<OperationState> {
        self.shared.state_tx.subscribe()
    }

    pub fn status(&self) -> Option<StatusMessage> {
        self.shared.notifier.current()
    }

    pub async fn state(&self) -> OperationState {
        self.shared.state.lock().await.state
    }

    pub async fn snapshot(&self) -> FlowSnapshot {
        let guard = self.shared.state.lock().await;
        FlowSnapshot {
            state: guard.state,
            fields: guard.fields.clone(),
            validation: guard.validation.clone(),
            challenge: guard.gate.current().map(|token| token.challenge().clone()),
            handle: guard.handle.clone(),
            failure: guard.failure.clone(),
            status: self.shared.notifier.current(),
        }
    }

    /// Replaces the form input and re-runs validation. Self-referential fields are prefilled
    /// from the connected identity.
    pub async fn update_fields(&self, fields: FormFields) -> ValidationResult {
        let mut guard = self.shared.state.lock().await;
        self.apply_fields(&mut guard, fields)
    }

    /// Changes one field, keeping every other field as it is.
    pub async fn set_field(&self, name: &str, value: impl Into<String>) -> ValidationResult {
        let mut guard = self.shared.state.lock().await;
        let mut fields = guard.fields.clone();
        fields.insert(name.to_string(), value.into());
        self.apply_fields(&mut guard, fields)
    }

    fn apply_fields(&self, guard: &mut FlowState, mut fields: FormFields) -> ValidationResult {
        let signer = self.shared.identity.current_signer();
        self.shared.spec.prefill(&mut fields, signer.as_ref());
        let validation = self.shared.spec.validate(&fields, signer.as_ref());

        if !matches!(
            guard.state,
            OperationState::Idle | OperationState::Validating
        ) {
            debug!(flow = self.shared.spec.name, state = %guard.state, "form is locked");
            return validation;
        }
        guard.fields = fields;
        guard.validation = validation.clone();
        if guard.state == OperationState::Idle {
            self.advance(guard, OperationState::Validating, None);
        }
        validation
    }

    /// User-initiated submit. Validates once more, then either arms the confirmation step or
    /// submits straight away.
    pub async fn submit(&self) -> Result<SubmitProgress, FlowError> {
        let mut guard = self.shared.state.lock().await;
        if guard.in_flight || guard.state.is_busy() {
            debug!(flow = self.shared.spec.name, "submit ignored; already in flight");
            return Err(FlowError::InFlight);
        }
        if !matches!(
            guard.state,
            OperationState::Idle | OperationState::Validating
        ) {
            return Err(FlowError::InvalidTransition {
                action: "submit",
                state: guard.state,
            });
        }
        if guard.state == OperationState::Idle {
            self.advance(&mut guard, OperationState::Validating, None);
        }

        let signer = self.shared.identity.current_signer();
        let request = match self.shared.spec.build_request(&guard.fields, signer.as_ref()) {
            Ok(request) => {
                guard.validation = ValidationResult::default();
                request
            }
            Err(result) => {
                guard.validation = result.clone();
                drop(guard);
                self.notify("Fix the highlighted fields", Severity::Error);
                return Err(ValidationError { result }.into());
            }
        };

        let decision = guard.gate.require_confirmation(&request);
        match decision {
            GateDecision::Approved => self.begin_submission(guard, request).await,
            GateDecision::Challenge(challenge) => {
                let correlation_id = request.correlation_id();
                guard.request = Some(request);
                self.advance(
                    &mut guard,
                    OperationState::AwaitingConfirmationStep,
                    Some(correlation_id),
                );
                drop(guard);
                self.notify(challenge.prompt(), Severity::Warning);
                Ok(SubmitProgress::AwaitingConfirmation(challenge))
            }
        }
    }

    /// Answers the confirmation step. A mismatch leaves the flow waiting for another attempt.
    pub async fn confirm(&self, input: &str) -> Result<SubmitProgress, FlowError> {
        let mut guard = self.shared.state.lock().await;
        if guard.state != OperationState::AwaitingConfirmationStep {
            return Err(FlowError::InvalidTransition {
                action: "confirm",
                state: guard.state,
            });
        }
        if let Err(mismatch) = guard.gate.verify(input) {
            drop(guard);
            self.notify(mismatch.to_string(), Severity::Error);
            return Err(mismatch.into());
        }
        let Some(request) = guard.request.take() else {
            return Err(FlowError::InvalidTransition {
                action: "confirm",
                state: guard.state,
            });
        };
        self.begin_submission(guard, request).await
    }

    /// Cancel / try again. Refused while a submission is mid-flight.
    pub async fn reset(&self) -> Result<(), FlowError> {
        let mut guard = self.shared.state.lock().await;
        if !guard.state.can_reset() {
            return Err(FlowError::InvalidTransition {
                action: "reset",
                state: guard.state,
            });
        }
        if let Some(follow) = guard.follow.take() {
            if guard.state == OperationState::Pending {
                debug!(handle = ?guard.handle, "abandoning pending attempt");
                follow.abort();
            }
        }
        guard.gate.discard();
        guard.request = None;
        guard.handle = None;
        guard.failure = None;
        guard.in_flight = false;
        if guard.state != OperationState::Idle {
            let from = guard.state;
            guard.state = OperationState::Idle;
            self.publish_transition(from, OperationState::Idle, None);
        }
        Ok(())
    }

    /// Hands over the terminal outcome for `handle`. Returns `false` when the outcome was
    /// already delivered or belongs to an attempt this flow no longer follows.
    pub async fn deliver_outcome(&self, handle: &OperationHandle, outcome: Outcome) -> bool {
        if !self.shared.tracker.mark_delivered(handle) {
            return false;
        }

        let mut guard = self.shared.state.lock().await;
        if guard.state != OperationState::Pending || guard.handle.as_ref() != Some(handle) {
            debug!(%handle, state = %guard.state, "stale outcome ignored");
            return false;
        }
        let correlation_id = guard.request.as_ref().map(OperationRequest::correlation_id);
        guard.in_flight = false;
        guard.follow = None;

        match outcome.status {
            TerminalStatus::Confirmed => {
                self.advance(&mut guard, OperationState::Confirmed, correlation_id);
                drop(guard);
                self.notify("Operation confirmed", Severity::Success);
                if let Err(err) = self.shared.refresher.refresh().await {
                    warn!(%handle, error = %err, "post-confirmation refresh failed");
                    self.notify(
                        format!("Saved, but some data may be out of date ({err})"),
                        Severity::Warning,
                    );
                }
            }
            TerminalStatus::Failed => {
                let error = ConfirmationError::from_detail(outcome.detail.as_deref());
                guard.failure = Some(error.to_string());
                self.advance(&mut guard, OperationState::Failed, correlation_id);
                drop(guard);
                self.notify(error.to_string(), Severity::Error);
            }
        }
        true
    }

    async fn begin_submission(
        &self,
        mut guard: MutexGuard<'_, FlowState>,
        request: OperationRequest,
    ) -> Result<SubmitProgress, FlowError> {
        let correlation_id = request.correlation_id();
        guard.in_flight = true;
        guard.request = Some(request.clone());
        self.advance(&mut guard, OperationState::Submitting, Some(correlation_id));
        drop(guard);
        self.notify("Waiting for wallet approval", Severity::Info);

        let submitted = self.shared.submitter.submit(&request).await;

        let mut guard = self.shared.state.lock().await;
        if guard.request.as_ref().map(OperationRequest::correlation_id) != Some(correlation_id) {
            // Unreachable while reset is refused during Submitting; keep the attempt keyed anyway.
            warn!(%correlation_id, "submission result for an abandoned attempt");
            return Err(FlowError::InvalidTransition {
                action: "submit",
                state: guard.state,
            });
        }

        match submitted {
            Ok(handle) => {
                guard.handle = Some(handle.clone());
                self.advance(&mut guard, OperationState::Pending, Some(correlation_id));
                guard.follow = Some(self.spawn_follow(handle.clone()));
                drop(guard);
                self.notify("Submitted; waiting for network confirmation", Severity::Info);
                Ok(SubmitProgress::Pending(handle))
            }
            Err(error) => {
                guard.in_flight = false;
                guard.failure = Some(error.to_string());
                self.advance(&mut guard, OperationState::Failed, Some(correlation_id));
                drop(guard);
                self.notify(error.to_string(), Severity::Error);
                Err(error.into())
            }
        }
    }

    /// Aborting the returned task drops the tracker's receiver, which ends the tracker too.
    fn spawn_follow(&self, handle: OperationHandle) -> AbortHandle {
        let flow = self.clone();
        let task = tokio::spawn(async move {
            let mut status = flow.shared.tracker.track(handle.clone());
            let terminal = async {
                match status.wait_for(|s| s.is_terminal()).await {
                    Ok(terminal) => terminal.outcome(),
                    Err(_) => None,
                }
            };
            let notice = tokio::time::sleep(flow.shared.settings.pending_notice_after);
            tokio::pin!(terminal);
            tokio::pin!(notice);
            let mut noticed = false;

            let outcome = loop {
                tokio::select! {
                    outcome = &mut terminal => break outcome,
                    _ = &mut notice, if !noticed => {
                        noticed = true;
                        flow.notice_still_pending(&handle).await;
                    }
                }
            };

            match outcome {
                Some(outcome) => {
                    flow.deliver_outcome(&handle, outcome).await;
                }
                None => warn!(%handle, "tracking ended without an outcome"),
            }
        });
        task.abort_handle()
    }

    async fn notice_still_pending(&self, handle: &OperationHandle) {
        let guard = self.shared.state.lock().await;
        if guard.state == OperationState::Pending && guard.handle.as_ref() == Some(handle) {
            drop(guard);
            self.notify(
                "Still waiting for network confirmation",
                Severity::Warning,
            );
        }
    }

    fn advance(
        &self,
        guard: &mut FlowState,
        to: OperationState,
        correlation_id: Option<CorrelationId>,
    ) {
        let from = guard.state;
        if !from.can_advance_to(to) {
            warn!(flow = self.shared.spec.name, %from, %to, "illegal transition refused");
            return;
        }
        guard.state = to;
        self.publish_transition(from, to, correlation_id);
    }

    fn publish_transition(
        &self,
        from: OperationState,
        to: OperationState,
        correlation_id: Option<CorrelationId>,
    ) {
        info!(
            flow = self.shared.spec.name,
            %from,
            %to,
            correlation_id = ?correlation_id,
            "state transition"
        );
        self.shared.state_tx.send_replace(to);
        let _ = self.shared.events.send(FlowEvent::Transition {
            from,
            to,
            correlation_id,
        });
    }

    fn notify(&self, text: impl Into<String>, severity: Severity) {
        let message = self.shared.notifier.notify(text, severity);
        let _ = self.shared.events.send(FlowEvent::Status(message));
    }
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
