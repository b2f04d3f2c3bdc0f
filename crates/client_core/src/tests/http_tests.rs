use std::sync::Mutex;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::{ActionId, Address};
use tokio::net::TcpListener;

use super::*;
use crate::StaticIdentity;

const SIGNER: &str = "0x00000000000000000000000000000000000000aa";

#[derive(Clone, Default)]
struct StubLedger {
    submitted: Arc<Mutex<Vec<SubmitOperationRequest>>>,
}

async fn submit(
    State(stub): State<StubLedger>,
    Json(req): Json<SubmitOperationRequest>,
) -> Result<Json<SubmitOperationResponse>, (StatusCode, Json<ApiError>)> {
    if req.action.as_str() == "mint" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                shared::error::ErrorCode::UnknownAction,
                "unknown action mint",
            )),
        ));
    }
    stub.submitted.lock().unwrap().push(req);
    Ok(Json(SubmitOperationResponse {
        handle: OperationHandle::new("0xfeed"),
    }))
}

async fn status(Path(handle): Path<String>) -> Result<Json<OperationStatusResponse>, StatusCode> {
    let (status, detail) = match handle.as_str() {
        "0xfeed" => (OutcomeStatus::Confirmed, None),
        "0xdead" => (OutcomeStatus::Failed, Some("insufficient balance".to_string())),
        "0xwait" => (OutcomeStatus::Pending, None),
        _ => return Err(StatusCode::NOT_FOUND),
    };
    Ok(Json(OperationStatusResponse {
        handle: OperationHandle::new(handle),
        status,
        detail,
    }))
}

async fn query(Path(key): Path<String>) -> Json<QueryResponse> {
    Json(QueryResponse {
        key: QueryKey::new(key),
        value: json!(250),
    })
}

async fn spawn_stub_ledger() -> Result<(String, StubLedger)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let stub = StubLedger::default();
    let app = Router::new()
        .route("/operations", post(submit))
        .route("/operations/:handle", get(status))
        .route("/queries/:key", get(query))
        .with_state(stub.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), stub))
}

fn client(url: &str) -> LedgerHttpClient {
    let identity = StaticIdentity::new(Some(Address::parse(SIGNER).expect("address")));
    LedgerHttpClient::new(url, identity).expect("client")
}

#[tokio::test]
async fn submit_posts_request_with_signer() {
    let (url, stub) = spawn_stub_ledger().await.expect("spawn stub");
    let request = OperationRequest::new(
        ActionId::new("set_platform_fee"),
        vec![json!(250)],
        None,
    );

    let handle = client(&url).submit(&request).await.expect("submit");
    assert_eq!(handle.as_str(), "0xfeed");

    let submitted = stub.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].correlation_id, request.correlation_id());
    assert_eq!(submitted[0].args, vec![json!(250)]);
    assert_eq!(submitted[0].from.as_ref().map(Address::as_str), Some(SIGNER));
}

#[tokio::test]
async fn api_errors_surface_their_message() {
    let (url, _stub) = spawn_stub_ledger().await.expect("spawn stub");
    let request = OperationRequest::new(ActionId::new("mint"), Vec::new(), None);
    let err = client(&url).submit(&request).await.expect_err("rejected");
    assert!(err.to_string().contains("unknown action mint"), "{err:#}");
}

#[tokio::test]
async fn probe_maps_ledger_statuses() {
    let (url, _stub) = spawn_stub_ledger().await.expect("spawn stub");
    let ledger = client(&url);

    assert_eq!(
        ledger.probe(&OperationHandle::new("0xfeed")).await.expect("probe"),
        ProbeStatus::Resolved(Outcome::confirmed())
    );
    assert_eq!(
        ledger.probe(&OperationHandle::new("0xdead")).await.expect("probe"),
        ProbeStatus::Resolved(Outcome::failed("insufficient balance"))
    );
    assert_eq!(
        ledger.probe(&OperationHandle::new("0xwait")).await.expect("probe"),
        ProbeStatus::Pending
    );
    assert_eq!(
        ledger.probe(&OperationHandle::new("0xnope")).await.expect("probe"),
        ProbeStatus::Pending
    );
}

#[tokio::test]
async fn refetch_updates_the_read_cache() {
    let (url, _stub) = spawn_stub_ledger().await.expect("spawn stub");
    let ledger = client(&url);
    let key = QueryKey::new("platform_fee");

    assert_eq!(ledger.cached(&key).await, None);
    ledger.refetch(&key).await.expect("refetch");
    assert_eq!(ledger.cached(&key).await, Some(json!(250)));
}

#[tokio::test]
async fn unreachable_ledger_is_a_transport_error() {
    let ledger = client("http://127.0.0.1:9");
    let request = OperationRequest::new(ActionId::new("deposit_funds"), Vec::new(), Some("1".into()));
    let err = ledger.submit(&request).await.expect_err("unreachable");
    let classified = crate::error::SubmissionError::classify(format!("{err:#}"));
    assert_eq!(classified.kind, crate::error::SubmissionFailure::Transport);
}

#[test]
fn rejects_urls_that_cannot_be_a_base() {
    let identity = StaticIdentity::new(None);
    assert!(LedgerHttpClient::new("mailto:ledger@example.com", identity.clone()).is_err());
    assert!(LedgerHttpClient::new("not a url", identity).is_err());
}
