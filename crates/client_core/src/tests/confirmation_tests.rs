use rand::{rngs::StdRng, SeedableRng};
use shared::domain::ActionId;

use super::*;

fn request() -> OperationRequest {
    OperationRequest::new(ActionId::new("withdraw_funds"), Vec::new(), None)
}

fn armed_code(gate: &mut ConfirmationGate) -> String {
    match gate.require_confirmation(&request()) {
        GateDecision::Challenge(ConfirmationChallenge::Code { code }) => code,
        other => panic!("expected a code challenge, got {other:?}"),
    }
}

#[test]
fn routine_actions_are_approved_without_a_token() {
    let mut gate = ConfirmationGate::new(Impact::Routine, 6, Duration::from_secs(60));
    assert_eq!(gate.require_confirmation(&request()), GateDecision::Approved);
    assert!(gate.current().is_none());
    assert_eq!(gate.verify("anything"), Err(ConfirmationMismatchError::NotAwaiting));
}

#[tokio::test]
async fn keyword_match_is_case_sensitive() {
    let mut gate = ConfirmationGate::new(
        Impact::Destructive {
            keyword: "DEACTIVATE",
        },
        6,
        Duration::from_secs(60),
    );
    let decision = gate.require_confirmation(&request());
    assert_eq!(
        decision,
        GateDecision::Challenge(ConfirmationChallenge::TypePhrase {
            keyword: "DEACTIVATE".into()
        })
    );

    assert_eq!(gate.verify("deactivate"), Err(ConfirmationMismatchError::Mismatch));
    assert!(gate.current().is_some(), "a mismatch keeps the token armed");
    assert_eq!(gate.verify("  DEACTIVATE \n"), Ok(()));
    assert!(gate.current().is_none(), "a match consumes the token");
    assert_eq!(gate.verify("DEACTIVATE"), Err(ConfirmationMismatchError::NotAwaiting));
}

#[tokio::test]
async fn every_entry_issues_a_fresh_code() {
    let mut gate = ConfirmationGate::new(Impact::Critical, 6, Duration::from_secs(60));
    let mut previous = armed_code(&mut gate);
    for _ in 0..20 {
        let next = armed_code(&mut gate);
        assert_ne!(next, previous);
        assert_eq!(next.len(), 6);
        previous = next;
    }

    let stale = previous.clone();
    let current = armed_code(&mut gate);
    assert_eq!(gate.verify(&stale), Err(ConfirmationMismatchError::Mismatch));
    assert_eq!(gate.verify(&current), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn tokens_expire_after_their_ttl() {
    let mut gate = ConfirmationGate::new(Impact::Critical, 4, Duration::from_secs(30));
    let code = armed_code(&mut gate);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(gate.current().is_some_and(ConfirmationToken::is_expired));
    assert_eq!(gate.verify(&code), Err(ConfirmationMismatchError::Expired));

    let fresh = armed_code(&mut gate);
    assert_eq!(gate.verify(&fresh), Ok(()));
}

#[tokio::test]
async fn discard_disarms_the_gate() {
    let mut gate = ConfirmationGate::new(
        Impact::Destructive { keyword: "RENOUNCE" },
        6,
        Duration::from_secs(60),
    );
    gate.require_confirmation(&request());
    gate.discard();
    assert_eq!(gate.verify("RENOUNCE"), Err(ConfirmationMismatchError::NotAwaiting));
}

#[test]
fn generated_codes_use_the_unambiguous_alphabet() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let code = generate_code(&mut rng, 8);
        assert_eq!(code.len(), 8);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)), "{code}");
        assert!(!code.contains(['0', 'O', '1', 'I', 'L']));
    }
}

#[test]
fn prompts_name_what_to_type() {
    assert_eq!(
        ConfirmationChallenge::TypePhrase {
            keyword: "RENOUNCE".into()
        }
        .prompt(),
        "Type RENOUNCE to confirm"
    );
    assert_eq!(
        ConfirmationChallenge::Code {
            code: "K7QX2M".into()
        }
        .prompt(),
        "Enter code K7QX2M to confirm"
    );
}
