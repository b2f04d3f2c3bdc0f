use std::{net::SocketAddr, path::Path as FsPath, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use server_api::{decode, Ledger};
use shared::{
    domain::{Address, OperationHandle, QueryKey},
    error::{ApiError, ErrorCode},
    protocol::{
        OperationStatusResponse, OutcomeStatus, QueryResponse, SubmitOperationRequest,
        SubmitOperationResponse,
    },
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};
use uuid::Uuid;

mod app_state;
mod config;

use app_state::{AppState, OperationRecord};
use config::load_settings;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings(FsPath::new("ledger.toml"));
    let admin = Address::parse(&settings.admin_address)
        .with_context(|| format!("invalid admin address '{}'", settings.admin_address))?;
    info!(%admin, delay = ?settings.inclusion_delay, "seeding development ledger");

    let state = AppState::new(Ledger::seeded(admin), settings.inclusion_delay);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "ledger listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/operations", post(submit_operation))
        .route("/operations/:handle", get(operation_status))
        .route("/queries/:key", get(run_query))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit_operation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitOperationRequest>,
) -> ApiResult<SubmitOperationResponse> {
    let action = decode(&req).map_err(|e| (status_for(e.code), Json(e)))?;

    let mut operations = state.operations.lock().await;
    if let Some(handle) = operations.by_correlation.get(&req.correlation_id) {
        info!(correlation_id = %req.correlation_id, %handle, "duplicate submission");
        return Ok(Json(SubmitOperationResponse {
            handle: handle.clone(),
        }));
    }

    let handle = OperationHandle::new(format!("0x{}", Uuid::new_v4().simple()));
    info!(
        correlation_id = %req.correlation_id,
        %handle,
        action = action.name(),
        "operation accepted"
    );
    operations
        .by_correlation
        .insert(req.correlation_id, handle.clone());
    operations.records.insert(
        handle.clone(),
        OperationRecord {
            action,
            from: req.from,
            status: OutcomeStatus::Pending,
            detail: None,
        },
    );
    drop(operations);

    let include = Arc::clone(&state);
    let included = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(include.inclusion_delay).await;
        include_operation(&include, &included).await;
    });

    Ok(Json(SubmitOperationResponse { handle }))
}

async fn include_operation(state: &AppState, handle: &OperationHandle) {
    let mut operations = state.operations.lock().await;
    let Some(record) = operations.records.get_mut(handle) else {
        return;
    };
    let applied = state
        .ledger
        .lock()
        .await
        .apply(record.from.as_ref(), &record.action);
    match applied {
        Ok(detail) => {
            record.status = OutcomeStatus::Confirmed;
            record.detail = Some(detail);
        }
        Err(revert) => {
            warn!(%handle, reason = %revert.reason, "operation reverted");
            record.status = OutcomeStatus::Failed;
            record.detail = Some(revert.reason);
        }
    }
}

async fn operation_status(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> ApiResult<OperationStatusResponse> {
    let handle = OperationHandle::new(handle);
    state
        .operations
        .lock()
        .await
        .status(&handle)
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("unknown operation {handle}"))),
            )
        })
}

async fn run_query(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<QueryResponse> {
    let key = QueryKey::new(key);
    let value = state
        .ledger
        .lock()
        .await
        .query(&key)
        .map_err(|e| (status_for(e.code), Json(e)))?;
    Ok(Json(QueryResponse { key, value }))
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::UnknownAction => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
