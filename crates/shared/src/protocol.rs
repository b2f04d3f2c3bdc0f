use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ActionId, Address, CorrelationId, OperationHandle, QueryKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOperationRequest {
    pub correlation_id: CorrelationId,
    pub action: ActionId,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Value to transfer, in base units, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOperationResponse {
    pub handle: OperationHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatusResponse {
    pub handle: OperationHandle,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub key: QueryKey,
    pub value: Value,
}
