//! reqwest adapter for the ledger HTTP API.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{OperationHandle, QueryKey},
    error::ApiError,
    protocol::{
        OperationStatusResponse, OutcomeStatus, QueryResponse, SubmitOperationRequest,
        SubmitOperationResponse,
    },
};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::{
    tracker::{OutcomeProbe, ProbeStatus},
    types::{OperationRequest, Outcome, TerminalStatus},
    IdentityInterface, ReadQueryInterface, SubmissionInterface,
};

pub struct LedgerHttpClient {
    http: Client,
    base_url: Url,
    identity: Arc<dyn IdentityInterface>,
    reads: RwLock<HashMap<QueryKey, serde_json::Value>>,
}

impl LedgerHttpClient {
    pub fn new(base_url: &str, identity: Arc<dyn IdentityInterface>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid ledger url '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("ledger url '{base_url}' cannot be used as a base"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            identity,
            reads: RwLock::new(HashMap::new()),
        })
    }

    /// Last value fetched for `key`, if any.
    pub async fn cached(&self, key: &QueryKey) -> Option<serde_json::Value> {
        self.reads.read().await.get(key).cloned()
    }

    pub async fn query(&self, key: &QueryKey) -> Result<serde_json::Value> {
        let res = self.http.get(self.endpoint(&["queries", key.as_str()])?).send().await?;
        let body: QueryResponse = ensure_success(res).await?.json().await?;
        self.reads
            .write()
            .await
            .insert(body.key.clone(), body.value.clone());
        Ok(body.value)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("ledger url cannot be used as a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn ensure_success(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow!("{status}: {api_error}")),
        Err(_) => Err(anyhow!("{status}: {body}")),
    }
}

#[async_trait]
impl SubmissionInterface for LedgerHttpClient {
    async fn submit(&self, request: &OperationRequest) -> Result<OperationHandle> {
        let payload = SubmitOperationRequest {
            correlation_id: request.correlation_id(),
            action: request.action().clone(),
            args: request.args().to_vec(),
            value: request.value().map(str::to_string),
            from: self.identity.current_signer(),
        };
        let res = self
            .http
            .post(self.endpoint(&["operations"])?)
            .json(&payload)
            .send()
            .await
            .context("failed to connect to ledger")?;
        let body: SubmitOperationResponse = ensure_success(res).await?.json().await?;
        Ok(body.handle)
    }
}

#[async_trait]
impl OutcomeProbe for LedgerHttpClient {
    async fn probe(&self, handle: &OperationHandle) -> Result<ProbeStatus> {
        let res = self
            .http
            .get(self.endpoint(&["operations", handle.as_str()])?)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            debug!(%handle, "ledger does not know the handle yet");
            return Ok(ProbeStatus::Pending);
        }
        let body: OperationStatusResponse = ensure_success(res).await?.json().await?;
        Ok(match body.status {
            OutcomeStatus::Pending => ProbeStatus::Pending,
            OutcomeStatus::Confirmed => ProbeStatus::Resolved(Outcome {
                status: TerminalStatus::Confirmed,
                detail: body.detail,
            }),
            OutcomeStatus::Failed => ProbeStatus::Resolved(Outcome {
                status: TerminalStatus::Failed,
                detail: body.detail,
            }),
        })
    }
}

#[async_trait]
impl ReadQueryInterface for LedgerHttpClient {
    async fn refetch(&self, key: &QueryKey) -> Result<()> {
        self.query(key).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
