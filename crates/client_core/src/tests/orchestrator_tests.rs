use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::Address;
use tokio::{sync::Notify, time::timeout};

use super::*;
use crate::{
    error::{ConfirmationMismatchError, SubmissionFailure},
    flows,
    tracker::{OutcomeFeed, OutcomeProbe, PollingConfirmation, ProbeStatus},
    StaticIdentity,
};

const SIGNER: &str = "0x00000000000000000000000000000000000000aa";
const OTHER: &str = "0x00000000000000000000000000000000000000bb";

#[derive(Default)]
struct FakeSubmission {
    calls: AtomicUsize,
    hold: Option<Arc<Notify>>,
    failure: Option<&'static str>,
    seen: StdMutex<Vec<CorrelationId>>,
}

#[async_trait]
impl SubmissionInterface for FakeSubmission {
    async fn submit(&self, request: &OperationRequest) -> Result<OperationHandle> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(request.correlation_id());
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        match self.failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(OperationHandle::new(format!("0x{n:04x}"))),
        }
    }
}

#[derive(Default)]
struct CountingReader {
    refetches: AtomicUsize,
    broken: bool,
}

#[async_trait]
impl ReadQueryInterface for CountingReader {
    async fn refetch(&self, key: &QueryKey) -> Result<()> {
        self.refetches.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(anyhow!("{key} is unavailable"));
        }
        Ok(())
    }
}

struct Harness {
    flow: TransactionFlow,
    submission: Arc<FakeSubmission>,
    feed: Arc<OutcomeFeed>,
    reader: Arc<CountingReader>,
}

impl Harness {
    fn submissions(&self) -> usize {
        self.submission.calls.load(Ordering::SeqCst)
    }

    fn refetches(&self) -> usize {
        self.reader.refetches.load(Ordering::SeqCst)
    }
}

fn settings() -> ClientSettings {
    ClientSettings {
        poll_interval: Duration::from_millis(20),
        ..ClientSettings::default()
    }
}

fn build(name: &str, submission: FakeSubmission, reader: CountingReader) -> Harness {
    build_with(name, submission, reader, settings())
}

fn build_with(
    name: &str,
    submission: FakeSubmission,
    reader: CountingReader,
    settings: ClientSettings,
) -> Harness {
    let submission = Arc::new(submission);
    let feed = OutcomeFeed::new();
    let reader = Arc::new(reader);
    let identity = StaticIdentity::new(Some(Address::parse(SIGNER).expect("address")));
    let flow = TransactionFlow::new(
        flows::find(name).expect("flow"),
        FlowDependencies {
            submission: submission.clone(),
            confirmation: feed.clone(),
            reader: reader.clone(),
            identity,
        },
        &settings,
    );
    Harness {
        flow,
        submission,
        feed,
        reader,
    }
}

fn fields(pairs: &[(&str, &str)]) -> FormFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn wait_for_state(flow: &TransactionFlow, target: OperationState) {
    let mut rx = flow.watch_state();
    timeout(Duration::from_secs(2), rx.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .expect("flow dropped");
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn submit_to_pending(harness: &Harness) -> OperationHandle {
    match harness.flow.submit().await.expect("submit") {
        SubmitProgress::Pending(handle) => handle,
        other => panic!("expected pending, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_input_never_reaches_the_submitter() {
    let harness = build("set_platform_fee", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("fee_bps", "-1")]))
        .await;

    let err = harness.flow.submit().await.expect_err("invalid");
    let FlowError::Validation(ValidationError { result }) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(result.error_for("fee_bps"), Some("Fee must be non-negative"));
    assert_eq!(harness.flow.state().await, OperationState::Validating);
    assert_eq!(harness.submissions(), 0);

    let snapshot = harness.flow.snapshot().await;
    assert!(snapshot.validation.error_for("fee_bps").is_some());
    assert_eq!(snapshot.status.map(|s| s.severity), Some(Severity::Error));
}

#[tokio::test]
async fn destructive_keyword_must_match_exactly() {
    let harness = build(
        "deactivate_organization",
        FakeSubmission::default(),
        CountingReader::default(),
    );
    harness
        .flow
        .update_fields(fields(&[("organization_id", "7")]))
        .await;

    let progress = harness.flow.submit().await.expect("submit");
    assert_eq!(
        progress,
        SubmitProgress::AwaitingConfirmation(ConfirmationChallenge::TypePhrase {
            keyword: "DEACTIVATE".into()
        })
    );
    assert_eq!(
        harness.flow.state().await,
        OperationState::AwaitingConfirmationStep
    );

    let err = harness.flow.confirm("deactivate").await.expect_err("mismatch");
    assert!(matches!(
        err,
        FlowError::ConfirmationMismatch(ConfirmationMismatchError::Mismatch)
    ));
    assert_eq!(
        harness.flow.state().await,
        OperationState::AwaitingConfirmationStep
    );
    assert_eq!(harness.submissions(), 0);

    let progress = harness.flow.confirm("DEACTIVATE").await.expect("confirm");
    assert!(matches!(progress, SubmitProgress::Pending(_)));
    assert_eq!(harness.submissions(), 1);
}

#[tokio::test]
async fn critical_code_is_regenerated_on_reentry() {
    let harness = build("withdraw_funds", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("recipient", OTHER), ("amount", "1.25")]))
        .await;

    let first = match harness.flow.submit().await.expect("submit") {
        SubmitProgress::AwaitingConfirmation(ConfirmationChallenge::Code { code }) => code,
        other => panic!("expected a code, got {other:?}"),
    };
    harness.flow.reset().await.expect("cancel");
    assert_eq!(harness.flow.state().await, OperationState::Idle);

    let second = match harness.flow.submit().await.expect("submit again") {
        SubmitProgress::AwaitingConfirmation(ConfirmationChallenge::Code { code }) => code,
        other => panic!("expected a code, got {other:?}"),
    };
    assert_ne!(first, second);

    let err = harness.flow.confirm(&first).await.expect_err("stale code");
    assert!(matches!(
        err,
        FlowError::ConfirmationMismatch(ConfirmationMismatchError::Mismatch)
    ));
    harness.flow.confirm(&second).await.expect("fresh code");
    assert_eq!(harness.submissions(), 1);
}

#[tokio::test]
async fn network_failure_lands_in_failed_without_refresh() {
    let harness = build("grant_role", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("role", "TEACHER"), ("account", OTHER)]))
        .await;
    let handle = submit_to_pending(&harness).await;

    harness.feed.publish(
        handle.clone(),
        Outcome::failed("AccessControl: caller is missing role ADMIN"),
    );
    wait_for_state(&harness.flow, OperationState::Failed).await;

    let snapshot = harness.flow.snapshot().await;
    assert_eq!(snapshot.handle, Some(handle));
    assert!(snapshot
        .failure
        .as_deref()
        .is_some_and(|reason| reason.contains("missing role ADMIN")));
    let status = snapshot.status.expect("status");
    assert_eq!(status.severity, Severity::Error);
    assert!(status.text.contains("missing role ADMIN"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.refetches(), 0);
}

#[tokio::test]
async fn confirmation_refreshes_each_affected_query_once() {
    let harness = build("enroll_student", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("program_id", "3"), ("student", OTHER)]))
        .await;
    let handle = submit_to_pending(&harness).await;

    harness.feed.publish(handle, Outcome::confirmed());
    wait_for_state(&harness.flow, OperationState::Confirmed).await;
    let affected = harness.flow.affected_queries().len();
    eventually(|| harness.refetches() == affected).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.refetches(), affected);
}

#[tokio::test]
async fn refresh_failure_is_a_warning_not_a_failure() {
    let harness = build(
        "set_platform_fee",
        FakeSubmission::default(),
        CountingReader {
            broken: true,
            ..Default::default()
        },
    );
    harness
        .flow
        .update_fields(fields(&[("fee_bps", "250"), ("current_fee_bps", "100")]))
        .await;
    let handle = submit_to_pending(&harness).await;
    harness.feed.publish(handle, Outcome::confirmed());

    eventually(|| {
        harness
            .flow
            .status()
            .is_some_and(|status| status.severity == Severity::Warning)
    })
    .await;
    assert_eq!(harness.flow.state().await, OperationState::Confirmed);
    let status = harness.flow.status().expect("status");
    assert!(status.text.starts_with("Saved, but some data may be out of date"));
}

#[tokio::test]
async fn second_submit_while_in_flight_is_refused() {
    let hold = Arc::new(Notify::new());
    let harness = build(
        "set_platform_fee",
        FakeSubmission {
            hold: Some(hold.clone()),
            ..Default::default()
        },
        CountingReader::default(),
    );
    harness
        .flow
        .update_fields(fields(&[("fee_bps", "250"), ("current_fee_bps", "100")]))
        .await;

    let first = {
        let flow = harness.flow.clone();
        tokio::spawn(async move { flow.submit().await })
    };
    wait_for_state(&harness.flow, OperationState::Submitting).await;

    assert!(matches!(harness.flow.submit().await, Err(FlowError::InFlight)));
    assert!(matches!(
        harness.flow.reset().await,
        Err(FlowError::InvalidTransition {
            action: "reset",
            state: OperationState::Submitting
        })
    ));

    hold.notify_one();
    let progress = first.await.expect("join").expect("first submit");
    assert!(matches!(progress, SubmitProgress::Pending(_)));
    assert!(matches!(harness.flow.submit().await, Err(FlowError::InFlight)));
    assert_eq!(harness.submissions(), 1);
}

#[tokio::test]
async fn duplicate_outcomes_are_applied_once() {
    let harness = build("enroll_student", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("program_id", "3"), ("student", OTHER)]))
        .await;
    let handle = submit_to_pending(&harness).await;

    assert!(harness.flow.deliver_outcome(&handle, Outcome::confirmed()).await);
    assert!(!harness.flow.deliver_outcome(&handle, Outcome::confirmed()).await);
    assert!(
        !harness
            .flow
            .deliver_outcome(&handle, Outcome::failed("late duplicate"))
            .await
    );
    harness.feed.publish(handle, Outcome::confirmed());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(harness.flow.state().await, OperationState::Confirmed);
    assert_eq!(harness.refetches(), harness.flow.affected_queries().len());
}

#[tokio::test]
async fn outcome_of_an_abandoned_attempt_is_ignored() {
    let harness = build("grant_role", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("role", "STUDENT"), ("account", OTHER)]))
        .await;
    let stale = submit_to_pending(&harness).await;

    harness.flow.reset().await.expect("reset from pending");
    harness.feed.publish(stale.clone(), Outcome::confirmed());
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(harness.flow.state().await, OperationState::Idle);
    assert_eq!(harness.refetches(), 0);

    let fresh = submit_to_pending(&harness).await;
    assert_ne!(fresh, stale);
    let seen = harness.submission.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1]);
}

#[tokio::test]
async fn transitions_only_follow_legal_edges() {
    let harness = build(
        "deactivate_program",
        FakeSubmission::default(),
        CountingReader::default(),
    );
    let mut events = harness.flow.subscribe();

    harness
        .flow
        .update_fields(fields(&[("program_id", "12")]))
        .await;
    harness.flow.submit().await.expect("submit");
    let handle = match harness.flow.confirm("DEACTIVATE").await.expect("confirm") {
        SubmitProgress::Pending(handle) => handle,
        other => panic!("expected pending, got {other:?}"),
    };
    harness.feed.publish(handle, Outcome::confirmed());
    wait_for_state(&harness.flow, OperationState::Confirmed).await;
    harness.flow.reset().await.expect("reset");

    let mut path = vec![OperationState::Idle];
    let mut correlation_ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::Transition {
            from,
            to,
            correlation_id,
        } = event
        {
            assert_eq!(Some(&from), path.last());
            assert!(
                from.can_advance_to(to) || (to == OperationState::Idle && from.can_reset()),
                "{from} -> {to}"
            );
            path.push(to);
            correlation_ids.extend(correlation_id);
        }
    }
    assert_eq!(
        path,
        [
            OperationState::Idle,
            OperationState::Validating,
            OperationState::AwaitingConfirmationStep,
            OperationState::Submitting,
            OperationState::Pending,
            OperationState::Confirmed,
            OperationState::Idle,
        ]
    );
    assert!(correlation_ids.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn rejected_submission_fails_without_a_handle() {
    let harness = build(
        "grant_role",
        FakeSubmission {
            failure: Some("User denied transaction signature"),
            ..Default::default()
        },
        CountingReader::default(),
    );
    harness
        .flow
        .update_fields(fields(&[("role", "ADMIN"), ("account", OTHER)]))
        .await;

    let err = harness.flow.submit().await.expect_err("declined");
    let FlowError::Submission(error) = err else {
        panic!("expected a submission error, got {err:?}");
    };
    assert_eq!(error.kind, SubmissionFailure::Declined);

    let snapshot = harness.flow.snapshot().await;
    assert_eq!(snapshot.state, OperationState::Failed);
    assert_eq!(snapshot.handle, None);
    assert_eq!(snapshot.failure.as_deref(), Some("Request declined in wallet"));

    assert!(matches!(
        harness.flow.submit().await,
        Err(FlowError::InvalidTransition { .. })
    ));
    harness.flow.reset().await.expect("try again");
    assert_eq!(harness.flow.snapshot().await.fields.get("role").map(String::as_str), Some("ADMIN"));
}

#[tokio::test]
async fn long_pending_operations_get_a_notice() {
    let harness = build_with(
        "deposit_funds",
        FakeSubmission::default(),
        CountingReader::default(),
        ClientSettings {
            pending_notice_after: Duration::from_millis(30),
            ..settings()
        },
    );
    let mut events = harness.flow.subscribe();
    harness.flow.update_fields(fields(&[("amount", "0.5")])).await;
    submit_to_pending(&harness).await;

    let notice = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(FlowEvent::Status(message)) = events.recv().await {
                if message.text == "Still waiting for network confirmation" {
                    return message;
                }
            }
        }
    })
    .await
    .expect("notice");
    assert_eq!(notice.severity, Severity::Warning);
    assert_eq!(harness.flow.state().await, OperationState::Pending);
}

#[tokio::test]
async fn form_is_locked_once_submitted() {
    let harness = build("grant_role", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("role", "TEACHER"), ("account", OTHER)]))
        .await;
    submit_to_pending(&harness).await;

    harness.flow.set_field("role", "ADMIN").await;
    assert_eq!(
        harness.flow.snapshot().await.fields.get("role").map(String::as_str),
        Some("TEACHER")
    );
}

#[tokio::test]
async fn confirm_outside_the_confirmation_step_is_refused() {
    let harness = build("set_platform_fee", FakeSubmission::default(), CountingReader::default());
    assert!(matches!(
        harness.flow.confirm("anything").await,
        Err(FlowError::InvalidTransition {
            action: "confirm",
            state: OperationState::Idle
        })
    ));
}

fn transitions(events: &mut broadcast::Receiver<FlowEvent>) -> Vec<OperationState> {
    let mut path = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::Transition { from, to, .. } = event {
            if path.is_empty() {
                path.push(from);
            }
            path.push(to);
        }
    }
    path
}

#[tokio::test]
async fn role_grant_confirms_and_refreshes_once() {
    let harness = build("grant_role", FakeSubmission::default(), CountingReader::default());
    let mut events = harness.flow.subscribe();
    harness
        .flow
        .update_fields(fields(&[("role", "TEACHER"), ("account", OTHER)]))
        .await;
    let handle = submit_to_pending(&harness).await;

    harness.feed.publish(handle, Outcome::confirmed());
    wait_for_state(&harness.flow, OperationState::Confirmed).await;
    eventually(|| harness.refetches() == 1).await;

    assert_eq!(
        transitions(&mut events),
        [
            OperationState::Idle,
            OperationState::Validating,
            OperationState::Submitting,
            OperationState::Pending,
            OperationState::Confirmed,
        ]
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.refetches(), 1);
    assert_eq!(harness.submissions(), 1);
}

#[tokio::test]
async fn reverted_withdrawal_fails_with_a_reason() {
    let harness = build("withdraw_funds", FakeSubmission::default(), CountingReader::default());
    harness
        .flow
        .update_fields(fields(&[("recipient", OTHER), ("amount", "500")]))
        .await;
    let code = match harness.flow.submit().await.expect("submit") {
        SubmitProgress::AwaitingConfirmation(ConfirmationChallenge::Code { code }) => code,
        other => panic!("expected a code, got {other:?}"),
    };
    let handle = match harness.flow.confirm(&code).await.expect("confirm") {
        SubmitProgress::Pending(handle) => handle,
        other => panic!("expected pending, got {other:?}"),
    };

    harness
        .feed
        .publish(handle, Outcome::failed("insufficient balance"));
    wait_for_state(&harness.flow, OperationState::Failed).await;

    let failure = harness.flow.snapshot().await.failure.expect("failure message");
    assert_eq!(failure, "operation failed on the network: insufficient balance");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.refetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn status_expires_while_operation_stays_pending() {
    let harness = build("deposit_funds", FakeSubmission::default(), CountingReader::default());
    harness.flow.update_fields(fields(&[("amount", "1")])).await;
    submit_to_pending(&harness).await;
    assert!(harness.flow.status().is_some());

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(harness.flow.status(), None);
    assert_eq!(harness.flow.state().await, OperationState::Pending);
}

/// Ledger view in which the operation never lands.
#[derive(Default)]
struct StuckProbe {
    probes: AtomicUsize,
}

#[async_trait]
impl OutcomeProbe for StuckProbe {
    async fn probe(&self, _handle: &OperationHandle) -> Result<ProbeStatus> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeStatus::Pending)
    }
}

fn polling_flow(name: &str, probe: Arc<StuckProbe>, settings: ClientSettings) -> TransactionFlow {
    TransactionFlow::new(
        flows::find(name).expect("flow"),
        FlowDependencies {
            submission: Arc::new(FakeSubmission::default()),
            confirmation: Arc::new(PollingConfirmation::new(probe, settings.poll_interval)),
            reader: Arc::new(CountingReader::default()),
            identity: StaticIdentity::new(Some(Address::parse(SIGNER).expect("address"))),
        },
        &settings,
    )
}

#[tokio::test(start_paused = true)]
async fn reset_from_pending_stops_polling_the_abandoned_handle() {
    let probe = Arc::new(StuckProbe::default());
    let flow = polling_flow("grant_role", probe.clone(), settings());

    for _ in 0..3 {
        flow.update_fields(fields(&[("role", "TEACHER"), ("account", OTHER)]))
            .await;
        assert!(matches!(
            flow.submit().await.expect("submit"),
            SubmitProgress::Pending(_)
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        flow.reset().await.expect("reset");
    }
    assert!(probe.probes.load(Ordering::SeqCst) > 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = probe.probes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(probe.probes.load(Ordering::SeqCst), before);
    assert_eq!(flow.state().await, OperationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn zero_poll_interval_still_reaches_pending_without_stalling() {
    let probe = Arc::new(StuckProbe::default());
    let flow = polling_flow(
        "grant_role",
        probe.clone(),
        ClientSettings {
            poll_interval: Duration::ZERO,
            ..ClientSettings::default()
        },
    );
    flow.update_fields(fields(&[("role", "TEACHER"), ("account", OTHER)]))
        .await;
    flow.submit().await.expect("submit");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(probe.probes.load(Ordering::SeqCst) > 1);
    assert_eq!(flow.state().await, OperationState::Pending);
    flow.reset().await.expect("reset");
}

#[tokio::test]
async fn concurrent_field_edits_are_all_kept() {
    let harness = build("grant_role", FakeSubmission::default(), CountingReader::default());
    tokio::join!(
        harness.flow.set_field("role", "TEACHER"),
        harness.flow.set_field("account", OTHER),
    );

    let snapshot = harness.flow.snapshot().await;
    assert_eq!(snapshot.fields.get("role").map(String::as_str), Some("TEACHER"));
    assert_eq!(snapshot.fields.get("account").map(String::as_str), Some(OTHER));
    assert!(snapshot.validation.is_valid());
}
